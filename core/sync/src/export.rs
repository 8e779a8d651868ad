//! Form-data bundles and the transmissions that carry them.
//!
//! Each submitted instance is exported once as `<uuid>.json` in the data
//! directory. A bundle that already exists is left untouched, so its MD5
//! (and therefore the remote ETag check) is stable across sync cycles.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldsync_codec::{MediaCodec, ResponseType};
use fieldsync_common::{Error, Result, TransmissionId};
use fieldsync_store::{RecordStore, Response, SurveyInstance};

/// Question metadata needed to export an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDef {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    #[serde(default)]
    pub text: String,
    /// Part of a repeatable question group.
    #[serde(default)]
    pub repeatable: bool,
}

/// Supplies the question model of a form.
pub trait FormDefinitionProvider: Send + Sync {
    /// Definition of `question_id` in `form_id`, or `None` if the form no
    /// longer has that question.
    fn question(&self, form_id: &str, question_id: &str) -> Option<QuestionDef>;
}

/// Form definitions held in memory, keyed by form id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticForms {
    forms: HashMap<String, Vec<QuestionDef>>,
}

impl StaticForms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_form(mut self, form_id: impl Into<String>, questions: Vec<QuestionDef>) -> Self {
        self.forms.insert(form_id.into(), questions);
        self
    }

    /// Load `{ "<form id>": [ { "id", "type", "text", "repeatable" } ] }`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn form_ids(&self) -> impl Iterator<Item = &str> {
        self.forms.keys().map(String::as_str)
    }
}

impl FormDefinitionProvider for StaticForms {
    fn question(&self, form_id: &str, question_id: &str) -> Option<QuestionDef> {
        self.forms
            .get(form_id)?
            .iter()
            .find(|q| q.id == question_id)
            .cloned()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    uuid: String,
    form_id: String,
    form_version: Option<f64>,
    data_point_id: Option<String>,
    submitter: Option<String>,
    submitted_date: Option<i64>,
    duration: i64,
    responses: Vec<BundleResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleResponse {
    question_id: String,
    question_text: String,
    iteration: Option<u32>,
    #[serde(rename = "type")]
    response_type: ResponseType,
    value: String,
}

/// Files produced for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedInstance {
    /// Bundle filename, `<uuid>.json`.
    pub bundle: String,
    /// Whether the bundle was written by this call.
    pub written: bool,
    /// Media basenames referenced by exported answers.
    pub media: Vec<String>,
    /// Transmissions registered for the bundle and media.
    pub transmissions: Vec<TransmissionId>,
}

/// Writes form-data bundles and registers their transmissions.
pub struct Exporter {
    store: Arc<RecordStore>,
    forms: Arc<dyn FormDefinitionProvider>,
    data_dir: PathBuf,
}

impl Exporter {
    pub fn new(
        store: Arc<RecordStore>,
        forms: Arc<dyn FormDefinitionProvider>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            forms,
            data_dir: data_dir.into(),
        }
    }

    pub fn bundle_path(&self, instance: &SurveyInstance) -> PathBuf {
        self.data_dir.join(bundle_name(instance))
    }

    /// Export `instance` and register one transmission per artifact.
    ///
    /// Registering is idempotent, so calling this again for an instance
    /// whose artifacts are partly synced only returns the existing ids.
    ///
    /// # Errors
    /// - `Error::Io` if the bundle cannot be written
    /// - `Error::DataIntegrity` if a media file is claimed by another instance
    pub fn export(&self, instance: &SurveyInstance) -> Result<ExportedInstance> {
        let responses: Vec<(Response, String)> = self
            .store
            .responses(instance.id)?
            .into_iter()
            .filter(|r| r.include)
            .filter_map(|r| match self.forms.question(&instance.form_id, &r.question_id) {
                Some(question) => Some((r, question.text)),
                None => {
                    debug!(
                        "Skipping answer to unknown question {} of form {}",
                        r.question_id, instance.form_id
                    );
                    None
                }
            })
            .collect();

        let media: BTreeSet<String> = responses
            .iter()
            .filter(|(r, _)| r.response_type.is_media())
            .filter_map(|(r, _)| {
                let reference = r.filename.as_deref().unwrap_or(&r.value);
                MediaCodec::filename(reference)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
            })
            .collect();

        let bundle = bundle_name(instance);
        let path = self.data_dir.join(&bundle);
        let written = if path.exists() {
            false
        } else {
            write_bundle(&path, &build_bundle(instance, responses))?;
            info!("Exported survey instance {} to {}", instance.uuid, bundle);
            true
        };

        let form_id = Some(instance.form_id.as_str());
        let mut transmissions = vec![self.store.create_transmission(instance.id, form_id, &bundle)?];
        for name in &media {
            transmissions.push(self.store.create_transmission(instance.id, form_id, name)?);
        }

        Ok(ExportedInstance {
            bundle,
            written,
            media: media.into_iter().collect(),
            transmissions,
        })
    }
}

fn bundle_name(instance: &SurveyInstance) -> String {
    format!("{}.json", instance.uuid)
}

fn build_bundle(instance: &SurveyInstance, responses: Vec<(Response, String)>) -> Bundle {
    Bundle {
        uuid: instance.uuid.clone(),
        form_id: instance.form_id.clone(),
        form_version: instance.form_version,
        data_point_id: instance.data_point_id.clone(),
        submitter: instance.submitter.clone(),
        submitted_date: instance.submitted_date,
        duration: instance.duration,
        responses: responses
            .into_iter()
            .map(|(r, question_text)| BundleResponse {
                question_id: r.question_id,
                question_text,
                iteration: r.iteration,
                response_type: r.response_type,
                value: r.value,
            })
            .collect(),
    }
}

/// Write to a temporary sibling first so a crash never leaves a partial
/// bundle under the final name.
fn write_bundle(path: &Path, bundle: &Bundle) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec_pretty(bundle).map_err(|e| Error::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
