use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use zora_types::CostTier;

/// A user-defined routine, one TOML file per routine under `routines/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineSpec {
    pub name: String,
    pub prompt: String,
    /// 5-field cron expression: minute hour day-of-month month day-of-week.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_tier: Option<CostTier>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub fn load_routines(dir: &Path) -> Vec<RoutineSpec> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "unreadable routine file");
                continue;
            }
        };
        match toml::from_str::<RoutineSpec>(&raw) {
            Ok(spec) => out.push(spec),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "invalid routine file");
            }
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// One field of a cron expression.
#[derive(Debug, Clone, PartialEq)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }

    fn is_restricted(&self) -> bool {
        matches!(self, CronField::Values(_))
    }
}

/// Parsed 5-field cron expression, matched at minute granularity against
/// UTC. When both day-of-month and day-of-week are restricted they combine
/// as OR, the way Vixie cron resolves the ambiguity.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expression: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            anyhow::bail!(
                "cron expression needs 5 fields, got {}: `{expression}`",
                fields.len()
            );
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 7).map(normalize_dow)?,
        })
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.matches(at.minute())
            || !self.hour.matches(at.hour())
            || !self.month.matches(at.month())
        {
            return false;
        }
        let dom = self.day_of_month.matches(at.day());
        let dow = self
            .day_of_week
            .matches(at.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> anyhow::Result<CronField> {
    if raw == "*" {
        return Ok(CronField::Any);
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("invalid step in `{part}`"))?,
            ),
            None => (part, 1),
        };
        if step == 0 {
            anyhow::bail!("zero step in `{part}`");
        }
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                a.parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("invalid range start in `{part}`"))?,
                b.parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("invalid range end in `{part}`"))?,
            )
        } else {
            let value = range
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("invalid value `{part}`"))?;
            (value, value)
        };
        if start < min || end > max || start > end {
            anyhow::bail!("field `{part}` out of range {min}-{max}");
        }
        let mut v = start;
        while v <= end {
            values.push(v);
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

/// Both 0 and 7 mean Sunday.
fn normalize_dow(field: CronField) -> CronField {
    match field {
        CronField::Values(values) => {
            let mut mapped: Vec<u32> = values
                .into_iter()
                .map(|v| if v == 7 { 0 } else { v })
                .collect();
            mapped.sort_unstable();
            mapped.dedup();
            CronField::Values(mapped)
        }
        any => any,
    }
}

/// Per-process firing guard: a routine fires at most once per matching
/// minute. Missed minutes while the process was down are skipped.
#[derive(Debug, Default)]
pub struct RoutineFireGuard {
    last_fired: HashMap<String, i64>,
}

impl RoutineFireGuard {
    pub fn should_fire(&mut self, routine: &RoutineSpec, now: DateTime<Utc>) -> bool {
        if !routine.enabled {
            return false;
        }
        let Ok(expr) = CronExpr::parse(&routine.schedule) else {
            tracing::warn!(routine = %routine.name, schedule = %routine.schedule, "unparsable cron expression");
            return false;
        };
        if !expr.matches(now) {
            return false;
        }
        let minute_stamp = now.timestamp() / 60;
        match self.last_fired.get(&routine.name) {
            Some(&last) if last == minute_stamp => false,
            _ => {
                self.last_fired.insert(routine.name.clone(), minute_stamp);
                true
            }
        }
    }
}
