//! Upstream image store (Orthanc REST).
//!
//! Every command the engine issues against the store can also be rendered as
//! a `curl` line for the `ORTHANC_OUT:` stream, so operators can replay it.
use crate::errors::{message_is_invalid_credential, ProcessorError};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Study metadata shown by the multi-uuid expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudySummary {
    pub uuid: String,
    pub study_date: String,
    pub institution: String,
    pub series_count: usize,
    pub instance_count: usize,
    pub modality: String,
    pub manufacturer: String,
    pub description: String,
    /// Only when the study holds a single series.
    pub acquisition_number: Option<String>,
    /// Only when the study holds a single image.
    pub instance_number: Option<String>,
}

pub trait UpstreamStore {
    fn describe_study(&self, uuid: &str) -> Result<StudySummary>;
    fn delete_study(&self, uuid: &str) -> Result<()>;
    /// Anonymize a study, returning the uuid of the anonymized copy.
    fn anonymize_study(&self, uuid: &str, subject_id: &str) -> Result<String>;
    /// Download a study archive to `dest`, returning the bytes written.
    fn download_archive(&self, uuid: &str, dest: &Path) -> Result<u64>;
    fn inspect_command(&self, uuid: &str) -> String;
    fn delete_command(&self, uuid: &str) -> String;
}

/// Blocking Orthanc client with bearer-token auth.
pub struct OrthancClient {
    base_url: String,
    token: String,
    agent: ureq::Agent,
}

impl OrthancClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(DEFAULT_TIMEOUT))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent: config.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn curl(&self, method: &str, path: &str) -> String {
        format!(
            "curl -s -X {method} -H 'Authorization: Bearer ${{ORTHANC_TOKEN}}' '{}'",
            self.url(path)
        )
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let start = Instant::now();
        let mut response = self
            .agent
            .get(&url)
            .header("Authorization", &self.auth_header())
            .call()
            .with_context(|| format!("GET {url}"))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(http_failure("GET", &url, status, &body));
        }
        let value = response
            .body_mut()
            .read_json::<Value>()
            .with_context(|| format!("decode GET {url}"))?;
        tracing::debug!(elapsed_ms = start.elapsed().as_millis(), url, "orthanc GET complete");
        Ok(value)
    }
}

impl UpstreamStore for OrthancClient {
    fn describe_study(&self, uuid: &str) -> Result<StudySummary> {
        let study = self.get_json(&format!("studies/{uuid}"))?;
        let tags = &study["MainDicomTags"];
        let series_ids: Vec<String> = study["Series"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let instances = self.get_json(&format!("studies/{uuid}/instances"))?;
        let instances = instances.as_array().cloned().unwrap_or_default();

        let mut summary = StudySummary {
            uuid: uuid.to_string(),
            study_date: tag(tags, "StudyDate"),
            institution: tag(tags, "InstitutionName"),
            series_count: series_ids.len(),
            instance_count: instances.len(),
            description: tag(tags, "StudyDescription"),
            ..StudySummary::default()
        };
        if let Some(first) = series_ids.first() {
            let series = self.get_json(&format!("series/{first}"))?;
            summary.modality = tag(&series["MainDicomTags"], "Modality");
            summary.manufacturer = tag(&series["MainDicomTags"], "Manufacturer");
        }
        if series_ids.len() == 1 {
            if let Some(instance) = instances.first() {
                let number = tag(&instance["MainDicomTags"], "AcquisitionNumber");
                summary.acquisition_number = (!number.is_empty()).then_some(number);
            }
        }
        if let [only] = instances.as_slice() {
            let number = tag(&only["MainDicomTags"], "InstanceNumber");
            summary.instance_number = (!number.is_empty()).then_some(number);
        }
        Ok(summary)
    }

    fn delete_study(&self, uuid: &str) -> Result<()> {
        let url = self.url(&format!("studies/{uuid}"));
        let mut response = self
            .agent
            .delete(&url)
            .header("Authorization", &self.auth_header())
            .call()
            .with_context(|| format!("DELETE {url}"))?;
        let status = response.status().as_u16();
        // Already gone upstream is the state we wanted.
        if response.status().is_success() || status == 404 {
            return Ok(());
        }
        let body = response.body_mut().read_to_string().unwrap_or_default();
        Err(http_failure("DELETE", &url, status, &body))
    }

    fn anonymize_study(&self, uuid: &str, subject_id: &str) -> Result<String> {
        let url = self.url(&format!("studies/{uuid}/anonymize"));
        let payload = json!({
            "Replace": { "PatientID": subject_id, "PatientName": subject_id },
            "KeepPrivateTags": false,
            "Force": true,
        });
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.auth_header())
            .send_json(&payload)
            .with_context(|| format!("POST {url}"))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(http_failure("POST", &url, status, &body));
        }
        let body: Value = response
            .body_mut()
            .read_json()
            .with_context(|| format!("decode POST {url}"))?;
        body["ID"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("anonymize {uuid}: response carries no ID"))
    }

    fn download_archive(&self, uuid: &str, dest: &Path) -> Result<u64> {
        let url = self.url(&format!("studies/{uuid}/archive"));
        let start = Instant::now();
        let mut response = self
            .agent
            .get(&url)
            .header("Authorization", &self.auth_header())
            .call()
            .with_context(|| format!("GET {url}"))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(http_failure("GET", &url, status, &body));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let mut reader = response.into_body().into_reader();
        let bytes = std::io::copy(&mut reader, &mut writer)
            .with_context(|| format!("write archive {}", dest.display()))?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            bytes,
            dest = %dest.display(),
            "archive downloaded"
        );
        Ok(bytes)
    }

    fn inspect_command(&self, uuid: &str) -> String {
        self.curl("GET", &format!("studies/{uuid}"))
    }

    fn delete_command(&self, uuid: &str) -> String {
        self.curl("DELETE", &format!("studies/{uuid}"))
    }
}

/// A non-success response. Rejected credentials are typed so the run stops.
fn http_failure(method: &str, url: &str, status: u16, body: &str) -> anyhow::Error {
    let message = format!("{method} {url} failed with HTTP {status}: {}", body.trim());
    if matches!(status, 401 | 403) || message_is_invalid_credential(body) {
        return ProcessorError::Auth(message).into();
    }
    anyhow!(message)
}

fn tag(tags: &Value, name: &str) -> String {
    tags[name].as_str().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curl_lines_never_embed_the_token() {
        let client = OrthancClient::new("http://orthanc:8042/", "secret-token");
        let line = client.delete_command("u1");
        assert_eq!(
            line,
            "curl -s -X DELETE -H 'Authorization: Bearer ${ORTHANC_TOKEN}' 'http://orthanc:8042/studies/u1'"
        );
        assert!(!client.inspect_command("u1").contains("secret-token"));
    }

    #[test]
    fn rejected_credentials_are_typed_as_auth() {
        use crate::errors::{classify_failure, FailureClass};

        let denied = http_failure("GET", "http://orthanc/studies/u1", 403, "");
        assert!(matches!(
            denied.downcast_ref::<ProcessorError>(),
            Some(ProcessorError::Auth(_))
        ));
        let signature = http_failure("DELETE", "http://orthanc/studies/u1", 500, "Invalid JWT Signature");
        assert_eq!(classify_failure(&signature), FailureClass::Auth);

        let missing = http_failure("GET", "http://orthanc/studies/u1", 500, "boom");
        assert_eq!(classify_failure(&missing), FailureClass::Counted);
        assert_eq!(missing.to_string(), "GET http://orthanc/studies/u1 failed with HTTP 500: boom");
    }

    #[test]
    fn missing_tags_read_as_empty() {
        let tags = json!({ "StudyDate": " 20240102 " });
        assert_eq!(tag(&tags, "StudyDate"), "20240102");
        assert_eq!(tag(&tags, "Modality"), "");
    }
}
