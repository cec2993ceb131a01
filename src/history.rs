//! ==============================================================================
//! history.rs - filter, sort and page the detection log
//! ==============================================================================
//!
//! purpose:
//!     the history view is re-derived from the unfiltered rows on every
//!     request: filter (all criteria AND-ed), stable sort on one field, then
//!     cut a fixed-size page.
//!
//! relationships:
//!     - used by: server.rs (GET /api/history)
//!     - uses: domain.rs (HistoryRow)
//!
//! ==============================================================================

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::HistoryRow;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakFilter {
    #[default]
    All,
    Leak,
    Normal,
}

impl LeakFilter {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Some(LeakFilter::All),
            "leak" | "true" => Some(LeakFilter::Leak),
            "normal" | "false" => Some(LeakFilter::Normal),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistoryFilter {
    pub sensor_id_contains: Option<String>,
    pub leak: LeakFilter,
    pub min_confidence: Option<f64>,
}

impl HistoryFilter {
    pub fn matches(&self, row: &HistoryRow) -> bool {
        let event = &row.event;

        if let Some(needle) = self.sensor_id_contains.as_deref() {
            let needle = needle.trim().to_lowercase();
            if !needle.is_empty() && !event.sensor_id.to_lowercase().contains(&needle) {
                return false;
            }
        }

        match self.leak {
            LeakFilter::All => {}
            LeakFilter::Leak if !event.leak_detected => return false,
            LeakFilter::Normal if event.leak_detected => return false,
            _ => {}
        }

        if let Some(min) = self.min_confidence {
            match event.confidence {
                Some(c) if c >= min => {}
                _ => return false,
            }
        }

        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Id,
    SensorId,
    SensorName,
    Confidence,
    LeakDetected,
}

impl SortKey {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "created_at" | "time" => Some(SortKey::CreatedAt),
            "id" => Some(SortKey::Id),
            "sensor_id" | "sensor" => Some(SortKey::SensorId),
            "sensor_name" | "name" => Some(SortKey::SensorName),
            "confidence" => Some(SortKey::Confidence),
            "leak_detected" | "leak" => Some(SortKey::LeakDetected),
            _ => None,
        }
    }

    fn compare(&self, a: &HistoryRow, b: &HistoryRow) -> Ordering {
        match self {
            SortKey::CreatedAt => a.event.created_at.cmp(&b.event.created_at),
            SortKey::Id => a.event.id.cmp(&b.event.id),
            SortKey::SensorId => a.event.sensor_id.cmp(&b.event.sensor_id),
            SortKey::SensorName => a.sensor_name.cmp(&b.sensor_name),
            SortKey::Confidence => match (a.event.confidence, b.event.confidence) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            SortKey::LeakDetected => a.event.leak_detected.cmp(&b.event.leak_detected),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistorySort {
    pub key: SortKey,
    pub direction: SortDirection,
}

/// Filter then stable-sort. Ties keep their input order in both directions.
pub fn apply(rows: &[HistoryRow], filter: &HistoryFilter, sort: HistorySort) -> Vec<HistoryRow> {
    let mut view: Vec<HistoryRow> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();

    view.sort_by(|a, b| match sort.direction {
        SortDirection::Asc => sort.key.compare(a, b),
        SortDirection::Desc => sort.key.compare(b, a),
    });

    view
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryPage {
    pub rows: Vec<HistoryRow>,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
    pub page_count: usize,
    pub total: usize,
    pub has_prev: bool,
    pub has_next: bool,
}

/// Cut page `page` (1-based) out of `rows`. Out-of-range pages clamp to the
/// nearest valid page.
pub fn paginate(rows: Vec<HistoryRow>, page: usize, page_size: usize) -> HistoryPage {
    let page_size = page_size.max(1);
    let total = rows.len();
    let page_count = total.div_ceil(page_size).max(1);
    let page = page.clamp(1, page_count);

    let rows = rows
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    HistoryPage {
        rows,
        page,
        page_size,
        page_count,
        total,
        has_prev: page > 1,
        has_next: page < page_count,
    }
}

/// raw query string of GET /api/history; every field optional
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub sensor: Option<String>,
    pub leak: Option<String>,
    pub min_confidence: Option<String>,
    pub sort: Option<String>,
    pub dir: Option<String>,
    /// kept as text so `?page=` reaches `parse` instead of failing extraction
    pub page: Option<String>,
}

/// a parsed history request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryQuery {
    pub filter: HistoryFilter,
    pub sort: HistorySort,
    /// 1-based, not yet clamped to the page count
    pub page: usize,
}

impl HistoryParams {
    /// Empty values are treated as absent; unknown values are an error.
    pub fn parse(&self) -> anyhow::Result<HistoryQuery> {
        let sensor_id_contains = self
            .sensor
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let leak = match self.leak.as_deref() {
            None => LeakFilter::All,
            Some(raw) => LeakFilter::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("unknown leak filter '{}'", raw))?,
        };

        let min_confidence = match self.min_confidence.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let value: f64 = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("min_confidence must be a number, got '{}'", raw))?;
                if !value.is_finite() {
                    anyhow::bail!("min_confidence must be finite, got '{}'", raw);
                }
                Some(value)
            }
        };

        let key = match self.sort.as_deref() {
            None => SortKey::default(),
            Some(raw) => {
                SortKey::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown sort key '{}'", raw))?
            }
        };

        let direction = match self.dir.as_deref().map(|d| d.trim().to_ascii_lowercase()) {
            None => SortDirection::default(),
            Some(d) if d.is_empty() || d == "desc" => SortDirection::Desc,
            Some(d) if d == "asc" => SortDirection::Asc,
            Some(d) => anyhow::bail!("unknown sort direction '{}'", d),
        };

        let page = match self.page.as_deref().map(str::trim) {
            None | Some("") => 1,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("page must be a positive integer, got '{}'", raw))?,
        };

        Ok(HistoryQuery {
            filter: HistoryFilter {
                sensor_id_contains,
                leak,
                min_confidence,
            },
            sort: HistorySort { key, direction },
            page,
        })
    }
}
