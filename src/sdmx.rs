use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::metadata_db::now_ts;
use crate::models::observation::ObservationRecord;

/// Hard cap on observations taken from a single payload.
pub const MAX_OBSERVATIONS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum SdmxError {
    #[error("malformed XML: {0}")]
    Malformed(#[from] quick_xml::Error),
}

/// Result of one parse run.
#[derive(Debug)]
pub struct ParseOutcome {
    pub records: Vec<ObservationRecord>,
    /// The payload was not well-formed XML; `records` holds one sentinel row
    /// carrying the error and a sample of the raw input.
    pub parse_error: bool,
    /// The observation cap was hit and the tail of the payload was dropped.
    pub truncated: bool,
}

/// Parse an SDMX 2.1 payload into observation records.
///
/// Observation elements are matched by local name (`Obs` / `Observation`),
/// which tolerates any of the generic/compact namespace prefixes. When no
/// such element exists, any element with numeric text is taken as a
/// last-resort observation. A malformed document never raises: it yields a
/// single sentinel record instead.
pub fn parse_observations(dataset_id: &str, xml: &str) -> ParseOutcome {
    match try_parse(dataset_id, xml) {
        Ok((mut records, truncated)) => {
            if records.is_empty() {
                records = numeric_fallback(dataset_id, xml);
                if !records.is_empty() {
                    tracing::info!(
                        "fallback: {} numeric elements taken as observations for {dataset_id}",
                        records.len()
                    );
                }
            }
            tracing::info!("parsed {} observations from {dataset_id}", records.len());
            ParseOutcome {
                records,
                parse_error: false,
                truncated,
            }
        }
        Err(e) => {
            tracing::error!("XML parsing failed for {dataset_id}: {e}");
            let mut attrs = serde_json::Map::new();
            attrs.insert("parse_error".to_string(), serde_json::json!(e.to_string()));
            attrs.insert(
                "raw_data_sample".to_string(),
                serde_json::json!(xml.chars().take(500).collect::<String>()),
            );
            ParseOutcome {
                records: vec![ObservationRecord {
                    dataset_id: dataset_id.to_string(),
                    record_id: 0,
                    ingestion_timestamp: now_ts(),
                    obs_value: String::new(),
                    time_period: String::new(),
                    additional_attributes: Some(attrs),
                }],
                parse_error: true,
                truncated: false,
            }
        }
    }
}

struct ObsBuilder {
    depth: usize,
    attrs: serde_json::Map<String, serde_json::Value>,
    obs_value: Option<String>,
    time_period: Option<String>,
    own_value: Option<String>,
    own_time: Option<String>,
    text: Option<String>,
}

impl ObsBuilder {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            attrs: serde_json::Map::new(),
            obs_value: None,
            time_period: None,
            own_value: None,
            own_time: None,
            text: None,
        }
    }

    fn finish(mut self, dataset_id: &str, record_id: i64, timestamp: &str) -> ObservationRecord {
        let obs_value = self.obs_value.or(self.own_value).unwrap_or_default();
        let time_period = self.time_period.or(self.own_time).unwrap_or_default();
        if obs_value.is_empty() {
            if let Some(text) = self.text {
                if !text.is_empty() {
                    self.attrs
                        .insert("raw_text".to_string(), serde_json::json!(text));
                }
            }
        }
        ObservationRecord {
            dataset_id: dataset_id.to_string(),
            record_id,
            ingestion_timestamp: timestamp.to_string(),
            obs_value,
            time_period,
            additional_attributes: if self.attrs.is_empty() {
                None
            } else {
                Some(self.attrs)
            },
        }
    }
}

fn is_observation_name(local: &[u8]) -> bool {
    local == b"Obs" || local == b"Observation"
}

fn local_lower(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_lowercase()
}

/// The observation element's own attributes. Value/time are fallbacks only;
/// child elements win when both are present.
fn collect_own_attrs(e: &BytesStart<'_>, builder: &mut ObsBuilder) {
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        let value = value.to_string();
        let key_lower = key.to_lowercase();
        if key_lower.contains("value") || key == "obsValue" {
            builder.own_value.get_or_insert_with(|| value.clone());
        }
        if key_lower.contains("time") || key_lower.contains("period") {
            builder.own_time.get_or_insert_with(|| value.clone());
        }
        builder
            .attrs
            .insert(format!("obs_{key_lower}"), serde_json::json!(value));
    }
}

/// An immediate child of the observation element: pull out `ObsValue@value`
/// and the TIME_PERIOD dimension, then fold every attribute into the map as
/// `<child_tag>_<attr>`.
fn collect_child_attrs(e: &BytesStart<'_>, builder: &mut ObsBuilder) {
    let tag_lower = local_lower(e.local_name().as_ref());
    let mut pairs: Vec<(String, String)> = Vec::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        if let Ok(value) = attr.unescape_value() {
            pairs.push((key, value.to_string()));
        }
    }

    if tag_lower == "obsvalue" {
        if let Some((_, v)) = pairs.iter().find(|(k, _)| k == "value") {
            builder.obs_value = Some(v.clone());
        }
    } else if tag_lower == "obsdimension"
        && pairs.iter().any(|(k, v)| k == "id" && v == "TIME_PERIOD")
    {
        if let Some((_, v)) = pairs.iter().find(|(k, _)| k == "value") {
            builder.time_period = Some(v.clone());
        }
    }

    for (key, value) in pairs {
        builder.attrs.insert(
            format!("{tag_lower}_{}", key.to_lowercase()),
            serde_json::json!(value),
        );
    }
}

fn try_parse(dataset_id: &str, xml: &str) -> Result<(Vec<ObservationRecord>, bool), SdmxError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let timestamp = now_ts();
    let mut records: Vec<ObservationRecord> = Vec::new();
    let mut current: Option<ObsBuilder> = None;
    let mut depth = 0usize;
    let mut truncated = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if current.is_none() && is_observation_name(e.local_name().as_ref()) {
                    let mut builder = ObsBuilder::new(depth);
                    collect_own_attrs(&e, &mut builder);
                    current = Some(builder);
                } else if let Some(builder) = current.as_mut() {
                    if depth == builder.depth + 1 {
                        collect_child_attrs(&e, builder);
                    }
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if current.is_none() && is_observation_name(e.local_name().as_ref()) {
                    let mut builder = ObsBuilder::new(depth);
                    collect_own_attrs(&e, &mut builder);
                    records.push(builder.finish(dataset_id, records.len() as i64, &timestamp));
                    if records.len() >= MAX_OBSERVATIONS {
                        truncated = true;
                        break;
                    }
                } else if let Some(builder) = current.as_mut() {
                    if depth == builder.depth + 1 {
                        collect_child_attrs(&e, builder);
                    }
                }
            }
            Event::Text(t) => {
                if let Some(builder) = current.as_mut() {
                    if depth == builder.depth + 1 {
                        if let Ok(text) = t.unescape() {
                            builder.text = Some(text.to_string());
                        }
                    }
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                let complete = current.as_ref().is_some_and(|b| depth == b.depth);
                if complete {
                    let builder = current.take().unwrap();
                    records.push(builder.finish(dataset_id, records.len() as i64, &timestamp));
                    if records.len() >= MAX_OBSERVATIONS {
                        truncated = true;
                        break;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if truncated {
        tracing::warn!("limiting to first {MAX_OBSERVATIONS} observations from {dataset_id}");
    }
    Ok((records, truncated))
}

fn is_numeric_text(text: &str) -> bool {
    let stripped: String = text.chars().filter(|c| *c != '.' && *c != '-').collect();
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit())
}

/// Last-resort scan: any element whose text content is numeric becomes an
/// observation, with the numeric text kept under `raw_text`.
fn numeric_fallback(dataset_id: &str, xml: &str) -> Vec<ObservationRecord> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let timestamp = now_ts();
    let mut records: Vec<ObservationRecord> = Vec::new();
    // Attributes of the innermost open element, so numeric leaves keep them.
    let mut open_attrs: Vec<serde_json::Map<String, serde_json::Value>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let mut attrs = serde_json::Map::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_lowercase();
                    if let Ok(value) = attr.unescape_value() {
                        attrs.insert(format!("obs_{key}"), serde_json::json!(value.to_string()));
                    }
                }
                open_attrs.push(attrs);
            }
            Ok(Event::Text(t)) => {
                let Ok(text) = t.unescape() else { continue };
                if is_numeric_text(&text) {
                    let mut attrs = open_attrs.last().cloned().unwrap_or_default();
                    attrs.insert("raw_text".to_string(), serde_json::json!(text.to_string()));
                    records.push(ObservationRecord {
                        dataset_id: dataset_id.to_string(),
                        record_id: records.len() as i64,
                        ingestion_timestamp: timestamp.clone(),
                        obs_value: String::new(),
                        time_period: String::new(),
                        additional_attributes: Some(attrs),
                    });
                    if records.len() >= MAX_OBSERVATIONS {
                        break;
                    }
                }
            }
            Ok(Event::End(_)) => {
                open_attrs.pop();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERIC_TWO_OBS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<message:GenericData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message"
                     xmlns:gen="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/data/generic">
  <message:DataSet>
    <gen:Series>
      <gen:Obs>
        <gen:ObsDimension id="TIME_PERIOD" value="2024"/>
        <gen:ObsValue value="100"/>
      </gen:Obs>
      <gen:Obs>
        <gen:ObsDimension id="TIME_PERIOD" value="2024"/>
        <gen:ObsValue value="200"/>
      </gen:Obs>
    </gen:Series>
  </message:DataSet>
</message:GenericData>"#;

    #[test]
    fn parses_generic_observations() {
        let outcome = parse_observations("101_1015", GENERIC_TWO_OBS);
        assert!(!outcome.parse_error);
        assert_eq!(outcome.records.len(), 2);

        let first = &outcome.records[0];
        assert_eq!(first.obs_value, "100");
        assert_eq!(first.time_period, "2024");
        assert_eq!(first.record_id, 0);
        let attrs = first.additional_attributes.as_ref().unwrap();
        assert_eq!(attrs["obsvalue_value"], serde_json::json!("100"));
        assert_eq!(attrs["obsdimension_id"], serde_json::json!("TIME_PERIOD"));

        assert_eq!(outcome.records[1].obs_value, "200");
        assert_eq!(outcome.records[1].record_id, 1);
    }

    #[test]
    fn parses_unprefixed_and_compact_names() {
        let xml = r#"<DataSet>
            <Obs TIME_PERIOD="2023" obsValue="7.5"/>
            <Observation><ObsValue value="9"/></Observation>
        </DataSet>"#;
        let outcome = parse_observations("d", xml);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].obs_value, "7.5");
        assert_eq!(outcome.records[0].time_period, "2023");
        assert_eq!(outcome.records[1].obs_value, "9");
    }

    #[test]
    fn obs_element_attributes_are_prefixed() {
        let xml = r#"<root><Obs OBS_STATUS="A"><ObsValue value="1"/></Obs></root>"#;
        let outcome = parse_observations("d", xml);
        let attrs = outcome.records[0].additional_attributes.as_ref().unwrap();
        assert_eq!(attrs["obs_obs_status"], serde_json::json!("A"));
    }

    #[test]
    fn raw_text_kept_when_value_missing() {
        let xml = r#"<root><Obs>42.5</Obs></root>"#;
        let outcome = parse_observations("d", xml);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].obs_value, "");
        let attrs = outcome.records[0].additional_attributes.as_ref().unwrap();
        assert_eq!(attrs["raw_text"], serde_json::json!("42.5"));
    }

    #[test]
    fn numeric_fallback_without_obs_elements() {
        let xml = r#"<data><row>123</row><row>45.6</row><label>testo</label></data>"#;
        let outcome = parse_observations("d", xml);
        assert!(!outcome.parse_error);
        assert_eq!(outcome.records.len(), 2);
        let attrs = outcome.records[0].additional_attributes.as_ref().unwrap();
        assert_eq!(attrs["raw_text"], serde_json::json!("123"));
    }

    #[test]
    fn malformed_xml_yields_sentinel() {
        let xml = "<GenericData><Obs></GenericData>";
        let outcome = parse_observations("101_1015", xml);
        assert!(outcome.parse_error);
        assert_eq!(outcome.records.len(), 1);
        let attrs = outcome.records[0].additional_attributes.as_ref().unwrap();
        assert!(attrs.contains_key("parse_error"));
        assert_eq!(attrs["raw_data_sample"], serde_json::json!(xml));
    }

    #[test]
    fn empty_self_closing_obs_counts() {
        let xml = r#"<GenericData><DataSet id="d"><Obs/></DataSet></GenericData>"#;
        let outcome = parse_observations("d", xml);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].obs_value, "");
    }

    #[test]
    fn caps_observation_count() {
        let mut xml = String::from("<root>");
        for i in 0..(MAX_OBSERVATIONS + 50) {
            xml.push_str(&format!(r#"<Obs><ObsValue value="{i}"/></Obs>"#));
        }
        xml.push_str("</root>");
        let outcome = parse_observations("d", &xml);
        assert!(outcome.truncated);
        assert_eq!(outcome.records.len(), MAX_OBSERVATIONS);
    }
}
