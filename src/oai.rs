//! OAI-PMH protocol client.
//!
//! Issues `ListRecords`, `ListSets` and `GetRecord` requests over HTTP and
//! normalizes responses into [`OaiRecord`]s at this boundary, so nothing
//! downstream ever handles raw protocol XML.
//!
//! # Pagination
//!
//! Each [`OaiSource::list_records`] call fetches exactly one page. The first
//! request carries the verb arguments (`metadataPrefix`, `from`, `until`,
//! `set`); every later request carries only the `resumptionToken`, as the
//! protocol requires. A page whose response omits the token, or carries an
//! empty `<resumptionToken/>`, ends the sequence.
//!
//! `ListSets` responses are paginated the same way and are walked to
//! completion by [`OaiSource::list_sets`].
//!
//! # Errors
//!
//! A repository answering `noRecordsMatch` yields an empty terminal page.
//! Transport failures, non-2xx statuses, malformed XML and any other OAI
//! error code fail the call with a [`ProtocolError`]. The client never
//! retries; retry policy belongs to the caller.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use crate::error::ProtocolError;
use crate::models::{HarvestJobConfig, OaiRecord, OaiSet, RecordPage, RejectedRecord};

/// OAI error code meaning "the query matched nothing".
const NO_RECORDS_MATCH: &str = "noRecordsMatch";
/// OAI error code for repositories that do not support sets.
const NO_SET_HIERARCHY: &str = "noSetHierarchy";

/// Maximum length of a response body quoted in an HTTP error.
const BODY_PREVIEW_LEN: usize = 500;

const UNKNOWN_IDENTIFIER: &str = "<unknown>";

/// A remote repository that can be harvested.
///
/// [`OaiClient`] is the HTTP implementation; tests and embedders may supply
/// their own.
#[async_trait]
pub trait OaiSource: Send + Sync {
    /// List every set the repository exposes, in repository order.
    async fn list_sets(&self, base_url: &str) -> Result<Vec<OaiSet>, ProtocolError>;

    /// Fetch one page of records.
    async fn list_records(&self, request: &ListRecordsRequest) -> Result<RecordPage, ProtocolError>;

    /// Fetch a single record by identifier.
    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        metadata_prefix: &str,
    ) -> Result<OaiRecord, ProtocolError>;
}

/// Arguments for one `ListRecords` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRecordsRequest {
    pub base_url: String,
    pub metadata_prefix: String,
    pub from_date: Option<NaiveDate>,
    pub until_date: Option<NaiveDate>,
    pub set_spec: Option<String>,
    pub resumption_token: Option<String>,
}

impl ListRecordsRequest {
    /// Request for the page after `token`, or the first page when `None`.
    pub fn for_job(job: &HarvestJobConfig, token: Option<String>) -> Self {
        Self {
            base_url: job.base_url.clone(),
            metadata_prefix: job.metadata_prefix.clone(),
            from_date: job.from_date,
            until_date: job.until_date,
            set_spec: job.set_spec.clone(),
            resumption_token: token,
        }
    }

    /// Query string parameters for this request.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("verb", "ListRecords".to_string())];
        if let Some(ref token) = self.resumption_token {
            params.push(("resumptionToken", token.clone()));
            return params;
        }
        params.push(("metadataPrefix", self.metadata_prefix.clone()));
        if let Some(from) = self.from_date {
            params.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(until) = self.until_date {
            params.push(("until", until.format("%Y-%m-%d").to_string()));
        }
        if let Some(ref set) = self.set_spec {
            if !set.is_empty() {
                params.push(("set", set.clone()));
            }
        }
        params
    }
}

/// HTTP implementation of [`OaiSource`].
pub struct OaiClient {
    http: reqwest::Client,
}

impl OaiClient {
    /// Build a client with a per-request timeout and user agent.
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self { http })
    }

    async fn fetch(
        &self,
        base_url: &str,
        params: &[(&'static str, String)],
    ) -> Result<String, ProtocolError> {
        let resp = self
            .http
            .get(base_url)
            .query(params)
            .send()
            .await
            .map_err(|source| ProtocolError::Transport {
                url: base_url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Http {
                status: status.as_u16(),
                body: body.chars().take(BODY_PREVIEW_LEN).collect(),
            });
        }

        resp.text().await.map_err(|source| ProtocolError::Transport {
            url: base_url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl OaiSource for OaiClient {
    async fn list_sets(&self, base_url: &str) -> Result<Vec<OaiSet>, ProtocolError> {
        let mut sets = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_tokens = HashSet::new();

        loop {
            let mut params = vec![("verb", "ListSets".to_string())];
            if let Some(ref t) = token {
                params.push(("resumptionToken", t.clone()));
            }

            let body = self.fetch(base_url, &params).await?;
            let response = parse_response(&body)?;
            if let Some((code, message)) = response.error {
                if code == NO_RECORDS_MATCH || code == NO_SET_HIERARCHY {
                    break;
                }
                return Err(ProtocolError::Oai { code, message });
            }
            sets.extend(response.sets);

            match response.resumption_token {
                Some(next) if seen_tokens.insert(next.clone()) => token = Some(next),
                Some(next) => {
                    warn!(base_url, token = %next, "ListSets resumption token repeated; stopping");
                    break;
                }
                None => break,
            }
        }

        Ok(sets)
    }

    async fn list_records(&self, request: &ListRecordsRequest) -> Result<RecordPage, ProtocolError> {
        let body = self.fetch(&request.base_url, &request.query_params()).await?;
        parse_list_records(&body)
    }

    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        metadata_prefix: &str,
    ) -> Result<OaiRecord, ProtocolError> {
        let params = [
            ("verb", "GetRecord".to_string()),
            ("identifier", identifier.to_string()),
            ("metadataPrefix", metadata_prefix.to_string()),
        ];
        let body = self.fetch(base_url, &params).await?;
        let response = parse_response(&body)?;
        if let Some((code, message)) = response.error {
            return Err(ProtocolError::Oai { code, message });
        }
        if let Some(record) = response.records.into_iter().next() {
            return Ok(record);
        }
        match response.rejected.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Err(ProtocolError::Xml("GetRecord response contains no record".into())),
        }
    }
}

/// Interpret a `ListRecords` response body as one page.
pub fn parse_list_records(xml: &str) -> Result<RecordPage, ProtocolError> {
    let response = parse_response(xml)?;
    if let Some((code, message)) = response.error {
        if code == NO_RECORDS_MATCH {
            return Ok(RecordPage::default());
        }
        return Err(ProtocolError::Oai { code, message });
    }
    Ok(RecordPage {
        records: response.records,
        rejected: response
            .rejected
            .into_iter()
            .map(|(identifier, e)| RejectedRecord {
                identifier,
                reason: e.to_string(),
            })
            .collect(),
        resumption_token: response.resumption_token,
    })
}

// ============ Response parsing ============

/// Everything this client reads out of an OAI-PMH response.
#[derive(Debug, Default)]
struct OaiResponse {
    records: Vec<OaiRecord>,
    /// Records with an unreadable header, by identifier.
    rejected: Vec<(String, ProtocolError)>,
    sets: Vec<OaiSet>,
    resumption_token: Option<String>,
    error: Option<(String, String)>,
}

#[derive(Default)]
struct RecordBuilder {
    identifier: Option<String>,
    datestamp: Option<String>,
    deleted: bool,
    metadata: String,
    set_specs: Vec<String>,
}

impl RecordBuilder {
    fn build(self) -> Result<OaiRecord, ProtocolError> {
        let identifier = self
            .identifier
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingField("identifier"))?;
        let datestamp = self
            .datestamp
            .ok_or(ProtocolError::MissingField("datestamp"))?;
        Ok(OaiRecord {
            identifier,
            datestamp: parse_datestamp(&datestamp)?,
            deleted: self.deleted,
            metadata: self.metadata,
            set_specs: self.set_specs,
        })
    }
}

#[derive(Default)]
struct SetBuilder {
    spec: String,
    name: String,
}

fn xml_error(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Xml(e.to_string())
}

/// Unescaped, trimmed text content of the element opened by `start`.
fn element_text(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<String, ProtocolError> {
    let raw = reader.read_text(start.name()).map_err(xml_error)?;
    let text = quick_xml::escape::unescape(raw.trim()).map_err(xml_error)?;
    Ok(text.into_owned())
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Result<Option<String>, ProtocolError> {
    match start.try_get_attribute(name).map_err(xml_error)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned())),
        None => Ok(None),
    }
}

fn parse_response(xml: &str) -> Result<OaiResponse, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response = OaiResponse::default();
    let mut record: Option<RecordBuilder> = None;
    let mut set: Option<SetBuilder> = None;
    let mut in_header = false;
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"OAI-PMH" => saw_root = true,
                b"error" => {
                    let code = attribute(&e, "code")?.unwrap_or_default();
                    let message = element_text(&mut reader, &e)?;
                    response.error = Some((code, message));
                }
                b"record" => record = Some(RecordBuilder::default()),
                b"header" => {
                    in_header = true;
                    if let Some(r) = record.as_mut() {
                        r.deleted = attribute(&e, "status")?.as_deref() == Some("deleted");
                    }
                }
                b"identifier" if in_header => {
                    let text = element_text(&mut reader, &e)?;
                    if let Some(r) = record.as_mut() {
                        r.identifier = Some(text);
                    }
                }
                b"datestamp" if in_header => {
                    let text = element_text(&mut reader, &e)?;
                    if let Some(r) = record.as_mut() {
                        r.datestamp = Some(text);
                    }
                }
                b"setSpec" => {
                    let text = element_text(&mut reader, &e)?;
                    if in_header {
                        if let Some(r) = record.as_mut() {
                            r.set_specs.push(text);
                        }
                    } else if let Some(s) = set.as_mut() {
                        s.spec = text;
                    }
                }
                b"setName" => {
                    let text = element_text(&mut reader, &e)?;
                    if let Some(s) = set.as_mut() {
                        s.name = text;
                    }
                }
                b"metadata" if record.is_some() => {
                    let raw = reader.read_text(e.name()).map_err(xml_error)?;
                    if let Some(r) = record.as_mut() {
                        r.metadata = raw.trim().to_string();
                    }
                }
                b"set" => set = Some(SetBuilder::default()),
                b"resumptionToken" => {
                    let token = element_text(&mut reader, &e)?;
                    response.resumption_token = Some(token).filter(|t| !t.is_empty());
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"error" => {
                    let code = attribute(&e, "code")?.unwrap_or_default();
                    response.error = Some((code, String::new()));
                }
                b"resumptionToken" => response.resumption_token = None,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"header" => in_header = false,
                b"record" => {
                    if let Some(r) = record.take() {
                        let identifier = r
                            .identifier
                            .clone()
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string());
                        match r.build() {
                            Ok(rec) => response.records.push(rec),
                            Err(e) => response.rejected.push((identifier, e)),
                        }
                    }
                }
                b"set" => {
                    if let Some(s) = set.take() {
                        if !s.spec.is_empty() && !s.name.is_empty() {
                            response.sets.push(OaiSet {
                                spec: s.spec,
                                name: s.name,
                            });
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ProtocolError::Xml("missing <OAI-PMH> root element".into()));
    }
    Ok(response)
}

/// Parse an OAI datestamp at day or second granularity.
pub fn parse_datestamp(s: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| ProtocolError::InvalidDatestamp(s.to_string()))
}
