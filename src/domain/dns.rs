//! DNS provider: zone/CNAME management plus the TXT ownership check, over a
//! bearer-token JSON REST API. Trait shape is the teacher's own
//! `server/domain/dns_provider.rs` (`create_txt_record`/`delete_txt_record`/
//! `verify_txt_record`), widened with the zone/CNAME operations the add-domain
//! protocol needs. Implemented against `reqwest` + `serde_json` rather than
//! the `cloudflare` crate: that crate is referenced by the teacher's
//! `dns_provider.rs` but never declared in any `Cargo.toml` in the pack.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EncliiError, ErrorKind};
use crate::settings::DnsSettings;

pub struct ZoneStatus {
    pub created: bool,
    pub nameservers: Vec<String>,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn ensure_zone(&self, hostname: &str) -> Result<ZoneStatus, EncliiError>;
    async fn create_cname_record(&self, hostname: &str, target: &str) -> Result<(), EncliiError>;
    async fn delete_cname_record(&self, hostname: &str) -> Result<(), EncliiError>;
    async fn verify_txt_record(&self, record_name: &str, expected_value: &str) -> Result<bool, EncliiError>;
}

pub struct HttpDnsProvider {
    api_base_url: String,
    api_token: String,
    zone_name: String,
    http: reqwest::Client,
}

impl HttpDnsProvider {
    pub fn new(settings: &DnsSettings) -> Self {
        Self {
            api_base_url: settings.api_base_url.clone(),
            api_token: settings.api_token.clone(),
            zone_name: settings.zone_name.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn zones_url(&self) -> String {
        format!("{}/zones", self.api_base_url)
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/records", self.api_base_url, self.zone_name)
    }
}

#[derive(Deserialize)]
struct ZoneResponse {
    created: bool,
    #[serde(default)]
    nameservers: Vec<String>,
}

#[derive(Deserialize)]
struct RecordListResponse {
    records: Vec<RecordEntry>,
}

#[derive(Deserialize)]
struct RecordEntry {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
}

#[async_trait]
impl DnsProvider for HttpDnsProvider {
    async fn ensure_zone(&self, hostname: &str) -> Result<ZoneStatus, EncliiError> {
        let response = self
            .http
            .put(self.zones_url())
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "name": hostname }))
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("zone ensure request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("zone ensure rejected with status {}", response.status())));
        }

        let body: ZoneResponse = response
            .json()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("zone ensure response decode failed: {e}")))?;

        Ok(ZoneStatus { created: body.created, nameservers: body.nameservers })
    }

    async fn create_cname_record(&self, hostname: &str, target: &str) -> Result<(), EncliiError> {
        let response = self
            .http
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({
                "type": "CNAME",
                "name": hostname,
                "content": target,
                "ttl": 300,
                "proxied": true,
                "comment": "managed by enclii domain controller",
            }))
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("CNAME create request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("CNAME create rejected with status {}", response.status())));
        }
        Ok(())
    }

    async fn delete_cname_record(&self, hostname: &str) -> Result<(), EncliiError> {
        let existing = self.find_record(hostname, "CNAME").await?;
        let Some(record) = existing else { return Ok(()) };

        let url = format!("{}/{}", self.records_url(), record.id);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("CNAME delete request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("CNAME delete rejected with status {}", response.status())));
        }
        Ok(())
    }

    async fn verify_txt_record(&self, record_name: &str, expected_value: &str) -> Result<bool, EncliiError> {
        match self.find_record(record_name, "TXT").await? {
            Some(record) => Ok(record.content == expected_value),
            None => Ok(false),
        }
    }
}

impl HttpDnsProvider {
    async fn find_record(&self, name: &str, record_type: &str) -> Result<Option<RecordEntry>, EncliiError> {
        let response = self
            .http
            .get(self.records_url())
            .bearer_auth(&self.api_token)
            .query(&[("name", name), ("type", record_type)])
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("record list request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("record list rejected with status {}", response.status())));
        }

        let body: RecordListResponse = response
            .json()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("record list response decode failed: {e}")))?;

        Ok(body.records.into_iter().find(|r| r.record_type == record_type && r.name == name))
    }
}
