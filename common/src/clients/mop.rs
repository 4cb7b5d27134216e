//! MOP sink: pushes result diffs to OResults via the MeOS online protocol.
//!
//! Keeps an in-memory roster (optionally loaded from a MOP XML export).
//! A start punch stamps the competitor's start time, a finish punch
//! computes the running time and flips the status to OK, and the updated
//! competitor is POSTed as a `MOPDiff` fragment.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Timelike};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::Client;
use crate::proto::Status;
use crate::punch::SiPunchLog;
use crate::system_info::MacAddress;

const MOP_ENDPOINT: &str = "https://api.oresults.eu/meos";
const MOP_NS: &str = "http://www.melin.nu/mop";

pub const STAT_OK: u32 = 1;
pub const STAT_MP: u32 = 3;
pub const STAT_DNF: u32 = 4;
pub const STAT_OOC: u32 = 15;
pub const STAT_DNS: u32 = 20;

const START_CODE: u16 = 1;
const FINISH_CODE: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeosCategory {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeosCompetitor {
    pub name: String,
    pub club: Option<u32>,
    pub card: Option<u32>,
    pub bib: Option<u32>,
    pub id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeosResult {
    pub competitor: MeosCompetitor,
    pub category: MeosCategory,
    pub stat: u32,
    pub start: Option<Duration>,
    pub time: Option<Duration>,
}

pub struct MopClient {
    api_key: String,
    /// Start time applied to a finish punch when no start was recorded.
    fallback_start: NaiveTime,
    results: Mutex<Vec<MeosResult>>,
    client: reqwest::Client,
}

impl MopClient {
    pub fn new(api_key: String, mop_xml: Option<&Path>, fallback_start: NaiveTime) -> Self {
        let results = match mop_xml {
            Some(path) => match Self::results_from_file(path) {
                Ok(results) => {
                    info!("Loaded {} competitors from {}", results.len(), path.display());
                    results
                }
                Err(err) => {
                    error!("Failed to load MOP roster from {}: {err}", path.display());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("HTTP client construction does not fail with static options");
        Self {
            api_key,
            fallback_start,
            results: Mutex::new(results),
            client,
        }
    }

    pub fn results_from_file(path: &Path) -> crate::Result<Vec<MeosResult>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::results_from_xml(&text))
    }

    /// Parses `cls` and `cmp`/`base` elements of a MOP document. Unknown
    /// elements are skipped, a `cmp` without `base` is dropped.
    pub fn results_from_xml(text: &str) -> Vec<MeosResult> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut categories: Vec<MeosCategory> = Vec::new();
        let mut results = Vec::new();

        let mut current_category: Option<MeosCategory> = None;
        let mut cmp_id: Option<u32> = None;
        let mut cmp_card: Option<u32> = None;
        let mut base: Option<(MeosCompetitor, u32, Option<Duration>, Option<Duration>, String)> =
            None;
        let mut in_base = false;

        loop {
            match reader.read_event() {
                Err(err) => {
                    error!("MOP XML parse error: {err}");
                    break;
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"cls" => {
                        let id = attr(&e, "id").unwrap_or_default();
                        current_category = Some(MeosCategory {
                            name: String::new(),
                            id,
                        });
                    }
                    b"cmp" => {
                        cmp_id = attr(&e, "id").and_then(|v| v.parse().ok());
                        cmp_card = attr(&e, "card").and_then(|v| v.parse().ok());
                    }
                    b"base" => {
                        let stat: u32 =
                            attr(&e, "stat").and_then(|v| v.parse().ok()).unwrap_or(STAT_DNS);
                        let start = attr(&e, "st")
                            .filter(|st| st.as_str() != "-1")
                            .and_then(|st| st.parse::<u64>().ok())
                            .map(|tenths| Duration::from_millis(tenths * 100));
                        let time = attr(&e, "rt")
                            .and_then(|rt| rt.parse::<u64>().ok())
                            .filter(|_| stat == STAT_OK)
                            .map(|tenths| Duration::from_millis(tenths * 100));
                        let competitor = MeosCompetitor {
                            name: String::new(),
                            club: attr(&e, "org").and_then(|v| v.parse().ok()),
                            card: cmp_card,
                            bib: attr(&e, "bib").and_then(|v| v.parse().ok()),
                            id: cmp_id,
                        };
                        let category = attr(&e, "cls").unwrap_or_default();
                        base = Some((competitor, stat, start, time, category));
                        in_base = true;
                    }
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    let text = e.unescape().unwrap_or_default().into_owned();
                    if in_base {
                        if let Some(base) = base.as_mut() {
                            base.0.name = text;
                        }
                    } else if let Some(category) = current_category.as_mut() {
                        category.name = text;
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"cls" => {
                        if let Some(category) = current_category.take() {
                            categories.push(category);
                        }
                    }
                    b"base" => in_base = false,
                    b"cmp" => {
                        if let Some((competitor, stat, start, time, category_id)) = base.take() {
                            let category = categories
                                .iter()
                                .find(|c| c.id == category_id)
                                .cloned()
                                .unwrap_or(MeosCategory {
                                    name: String::new(),
                                    id: category_id,
                                });
                            results.push(MeosResult {
                                competitor,
                                category,
                                stat,
                                start,
                                time,
                            });
                        }
                        cmp_id = None;
                        cmp_card = None;
                    }
                    _ => {}
                },
                Ok(_) => {}
            }
        }
        results
    }

    fn result_to_xml(result: &MeosResult) -> String {
        let competitor = &result.competitor;
        let id = competitor.id.unwrap_or(0);
        let org = competitor.club.unwrap_or(0);
        let st = match result.start {
            Some(start) => (start.as_secs() * 10).to_string(),
            None => "-1".to_owned(),
        };
        let rt = match result.time {
            Some(time) => (time.as_secs() * 10).to_string(),
            None => "0".to_owned(),
        };
        format!(
            "<cmp id=\"{id}\"><base org=\"{org}\" st=\"{st}\" rt=\"{rt}\" cls=\"{cls}\" \
             stat=\"{stat}\">{name}</base></cmp>",
            cls = result.category.id,
            stat = result.stat,
            name = escape(competitor.name.as_str()),
        )
    }

    /// Applies a punch to a roster entry: code 1 records the start, code 2
    /// the finish and the OK status.
    fn update_result(
        result: &mut MeosResult,
        code: u16,
        daytime: NaiveTime,
        fallback_start: NaiveTime,
    ) {
        let since_midnight = Duration::from_secs(u64::from(daytime.num_seconds_from_midnight()));
        match code {
            START_CODE => result.start = Some(since_midnight),
            FINISH_CODE => {
                let start = result.start.unwrap_or(Duration::from_secs(u64::from(
                    fallback_start.num_seconds_from_midnight(),
                )));
                result.time = Some(since_midnight.saturating_sub(start));
                result.stat = STAT_OK;
            }
            _ => {}
        }
    }

    async fn send_result(&self, result: &MeosResult) -> bool {
        let body = format!(
            "<MOPDiff xmlns=\"{MOP_NS}\">{}</MOPDiff>",
            Self::result_to_xml(result)
        );
        let response = self
            .client
            .post(MOP_ENDPOINT)
            .header("pwd", &self.api_key)
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                info!("Sending to OResults successful");
                true
            }
            Ok(response) => {
                error!("Sending to OResults unsuccessful: {}", response.status());
                false
            }
            Err(err) => {
                error!("MOP error: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl Client for MopClient {
    async fn run(&self) -> crate::Result<()> {
        std::future::pending().await
    }

    async fn send_punch(&self, punch_log: &SiPunchLog) -> bool {
        let punch = &punch_log.punch;
        let mut results = self.results.lock().await;
        let Some(result) =
            results.iter_mut().find(|result| result.competitor.card == Some(punch.card))
        else {
            error!("Competitor with card {} not in database", punch.card);
            return false;
        };
        Self::update_result(result, punch.code, punch.time.time(), self.fallback_start);
        let result = result.clone();
        drop(results);

        debug!("Updating result of {}", result.competitor.name);
        self.send_result(&result).await
    }

    async fn send_status(&self, _status: &Status, _mac_address: &MacAddress) -> bool {
        true
    }
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

#[cfg(test)]
mod test_mop {
    use super::*;

    const MOP_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MOPComplete xmlns="http://www.melin.nu/mop">
  <cls id="1">Men Open</cls>
  <cmp id="101" card="46283">
    <base org="7" st="36000" rt="0" cls="1" stat="20">Mats &amp; Co</base>
  </cmp>
  <cmp id="102" card="1715004">
    <base org="0" st="-1" rt="18000" cls="1" stat="1">Runner Two</base>
  </cmp>
</MOPComplete>"#;

    #[test]
    fn test_results_from_xml() {
        let results = MopClient::results_from_xml(MOP_XML);
        assert_eq!(results.len(), 2);

        let first = &results[0];
        assert_eq!(first.competitor.name, "Mats & Co");
        assert_eq!(first.competitor.card, Some(46283));
        assert_eq!(first.competitor.id, Some(101));
        assert_eq!(first.competitor.club, Some(7));
        assert_eq!(first.category.name, "Men Open");
        assert_eq!(first.stat, STAT_DNS);
        assert_eq!(first.start, Some(Duration::from_secs(3600)));
        // rt is only meaningful for stat OK
        assert_eq!(first.time, None);

        let second = &results[1];
        assert_eq!(second.start, None);
        assert_eq!(second.time, Some(Duration::from_secs(1800)));
        assert_eq!(second.stat, STAT_OK);
    }

    #[test]
    fn test_update_result() {
        let mut results = MopClient::results_from_xml(MOP_XML);
        let fallback = NaiveTime::from_hms_opt(10, 0, 0).unwrap();

        // Start punch, then finish punch
        let result = &mut results[0];
        MopClient::update_result(
            result,
            START_CODE,
            NaiveTime::from_hms_opt(10, 5, 0).unwrap(),
            fallback,
        );
        assert_eq!(result.start, Some(Duration::from_secs(36300)));
        MopClient::update_result(
            result,
            FINISH_CODE,
            NaiveTime::from_hms_opt(10, 35, 30).unwrap(),
            fallback,
        );
        assert_eq!(result.time, Some(Duration::from_secs(30 * 60 + 30)));
        assert_eq!(result.stat, STAT_OK);

        // Finish without a recorded start falls back to the configured
        // first start
        let result = &mut results[1];
        MopClient::update_result(
            result,
            FINISH_CODE,
            NaiveTime::from_hms_opt(10, 42, 0).unwrap(),
            fallback,
        );
        assert_eq!(result.time, Some(Duration::from_secs(42 * 60)));
    }

    #[test]
    fn test_result_to_xml() {
        let results = MopClient::results_from_xml(MOP_XML);
        let xml = MopClient::result_to_xml(&results[0]);
        assert_eq!(
            xml,
            "<cmp id=\"101\"><base org=\"7\" st=\"36000\" rt=\"0\" cls=\"1\" \
             stat=\"20\">Mats &amp; Co</base></cmp>"
        );
    }
}
