// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator functions plus the engine that runs them
// over a PriceSeries. Every output is aligned with the input bars: position i
// holds the value at bar i, or `None` while the indicator is warming up.
//
// Indicators are looked up by name in a static registry. Each entry knows its
// default parameters, how to validate them, and which output lines it yields.
// A bad spec fails on its own; the other specs in the same request are still
// computed.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod roc;
pub mod rsi;
pub mod sma;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::market_data::PriceSeries;

/// Upper bound for any window/period parameter.
const MAX_WINDOW: f64 = 10_000.0;

// ---------------------------------------------------------------------------
// IndicatorSpec
// ---------------------------------------------------------------------------

/// Name plus parameters. Two specs are the same indicator iff both match.
///
/// Written as `name(p1,p2)` (display, serde) and parsed from either that form
/// or the query-string form `name:p1:p2`. Omitted trailing parameters of a
/// known indicator are filled with its defaults, so `sma` and `sma:20` are
/// the same spec.
#[derive(Debug, Clone)]
pub struct IndicatorSpec {
    name: String,
    params: Vec<f64>,
}

impl IndicatorSpec {
    pub fn new(name: impl Into<String>, params: Vec<f64>) -> Self {
        let name = name.into().trim().to_lowercase();
        let mut params = params;
        if let Some(def) = lookup(&name) {
            if params.len() < def.defaults.len() {
                params.extend_from_slice(&def.defaults[params.len()..]);
            }
        }
        Self { name, params }
    }

    /// Parse a comma separated list such as `sma:10,sma:30,macd,rsi`.
    ///
    /// Unparseable tokens do not abort the list; they come back as failures.
    pub fn parse_list(list: &str) -> (BTreeSet<IndicatorSpec>, Vec<IndicatorFailure>) {
        let mut specs = BTreeSet::new();
        let mut failures = Vec::new();
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.parse::<IndicatorSpec>() {
                Ok(spec) => {
                    specs.insert(spec);
                }
                Err(err) => failures.push(IndicatorFailure::from_error(token, &err)),
            }
        }
        (specs, failures)
    }
}

impl PartialEq for IndicatorSpec {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndicatorSpec {}

impl PartialOrd for IndicatorSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndicatorSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name).then_with(|| {
            self.params
                .iter()
                .zip(&other.params)
                .map(|(a, b)| a.total_cmp(b))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| self.params.len().cmp(&other.params.len()))
        })
    }
}

impl Hash for IndicatorSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        for p in &self.params {
            p.to_bits().hash(state);
        }
    }
}

impl std::fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if self.params.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{p}")?;
        }
        f.write_str(")")
    }
}

impl FromStr for IndicatorSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| Error::InvalidIndicatorSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (name, rest): (&str, Vec<&str>) = match s.split_once('(') {
            Some((name, tail)) => {
                let inner = tail
                    .strip_suffix(')')
                    .ok_or_else(|| invalid("missing closing parenthesis"))?;
                let params = if inner.trim().is_empty() {
                    Vec::new()
                } else {
                    inner.split(',').collect()
                };
                (name, params)
            }
            None => {
                let mut parts = s.split(':');
                let name = parts.next().unwrap_or_default();
                (name, parts.collect())
            }
        };

        if name.trim().is_empty() {
            return Err(invalid("empty indicator name"));
        }
        let params = rest
            .iter()
            .map(|p| p.trim().parse::<f64>().map_err(|_| invalid("parameter is not a number")))
            .collect::<Result<Vec<f64>>>()?;

        Ok(Self::new(name, params))
    }
}

impl Serialize for IndicatorSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndicatorSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// One named output line, aligned with the source bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorLine {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSeries {
    pub spec: IndicatorSpec,
    /// Leading bars left undefined on the first line.
    pub warmup: usize,
    pub lines: Vec<IndicatorLine>,
}

impl IndicatorSeries {
    pub fn line(&self, name: &str) -> Option<&[Option<f64>]> {
        self.lines
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.values.as_slice())
    }
}

/// A spec that could not be computed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorFailure {
    pub spec: String,
    pub reason: String,
}

impl IndicatorFailure {
    fn from_error(spec: &str, err: &Error) -> Self {
        let reason = match err {
            Error::InvalidIndicatorSpec { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self {
            spec: spec.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResults {
    pub series: BTreeMap<IndicatorSpec, IndicatorSeries>,
    pub failures: Vec<IndicatorFailure>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Lines = Vec<Vec<Option<f64>>>;

struct IndicatorDef {
    name: &'static str,
    defaults: &'static [f64],
    lines: &'static [&'static str],
    /// Checks the parameters and returns the warm-up length for them.
    validate: fn(&[f64]) -> std::result::Result<usize, String>,
    compute: fn(&PriceSeries, &[f64]) -> Lines,
}

static REGISTRY: &[IndicatorDef] = &[
    IndicatorDef {
        name: "sma",
        defaults: &[20.0],
        lines: &["value"],
        validate: |p| Ok(window(p[0], "window")? - 1),
        compute: |s, p| vec![sma::sma(&s.closes(), p[0] as usize)],
    },
    IndicatorDef {
        name: "ema",
        defaults: &[20.0],
        lines: &["value"],
        validate: |p| Ok(window(p[0], "window")? - 1),
        compute: |s, p| vec![ema::ema(&s.closes(), p[0] as usize)],
    },
    IndicatorDef {
        name: "rsi",
        defaults: &[14.0],
        lines: &["value"],
        validate: |p| window(p[0], "period"),
        compute: |s, p| vec![rsi::rsi(&s.closes(), p[0] as usize)],
    },
    IndicatorDef {
        name: "macd",
        defaults: &[12.0, 26.0, 9.0],
        lines: &["macd", "signal", "histogram"],
        validate: |p| {
            let (fast, slow, signal) = (
                window(p[0], "fast")?,
                window(p[1], "slow")?,
                window(p[2], "signal")?,
            );
            if fast >= slow {
                return Err("fast period must be shorter than slow period".into());
            }
            Ok(slow - 1)
        },
        compute: |s, p| {
            let out = macd::macd(&s.closes(), p[0] as usize, p[1] as usize, p[2] as usize);
            vec![out.macd, out.signal, out.histogram]
        },
    },
    IndicatorDef {
        name: "bbands",
        defaults: &[20.0, 2.0],
        lines: &["upper", "middle", "lower"],
        validate: |p| {
            let w = window(p[0], "window")?;
            if !(p[1].is_finite() && p[1] > 0.0) {
                return Err("k must be a positive number".into());
            }
            Ok(w - 1)
        },
        compute: |s, p| {
            let bb = bollinger::bollinger(&s.closes(), p[0] as usize, p[1]);
            vec![bb.upper, bb.middle, bb.lower]
        },
    },
    IndicatorDef {
        name: "roc",
        defaults: &[1.0],
        lines: &["value"],
        validate: |p| window(p[0], "period"),
        compute: |s, p| vec![roc::roc(&s.closes(), p[0] as usize)],
    },
    IndicatorDef {
        name: "atr",
        defaults: &[14.0],
        lines: &["value"],
        validate: |p| window(p[0], "period"),
        compute: |s, p| vec![atr::atr(s.bars(), p[0] as usize)],
    },
];

fn lookup(name: &str) -> Option<&'static IndicatorDef> {
    REGISTRY.iter().find(|d| d.name == name)
}

/// Names of all registered indicators.
pub fn available() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|d| d.name)
}

/// A whole number in `1..=MAX_WINDOW`.
fn window(value: f64, what: &str) -> std::result::Result<usize, String> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(format!("{what} must be a whole number"));
    }
    if !(1.0..=MAX_WINDOW).contains(&value) {
        return Err(format!("{what} must be between 1 and {MAX_WINDOW}"));
    }
    Ok(value as usize)
}

fn resolve(spec: &IndicatorSpec) -> Result<(&'static IndicatorDef, usize)> {
    let invalid = |reason: String| Error::InvalidIndicatorSpec {
        spec: spec.to_string(),
        reason,
    };
    let def = lookup(&spec.name).ok_or_else(|| invalid("unknown indicator".into()))?;
    if spec.params.len() != def.defaults.len() {
        return Err(invalid(format!(
            "expected {} parameter(s), got {}",
            def.defaults.len(),
            spec.params.len()
        )));
    }
    let warmup = (def.validate)(&spec.params).map_err(invalid)?;
    Ok((def, warmup))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Compute one indicator over `series`.
pub fn compute_one(series: &PriceSeries, spec: &IndicatorSpec) -> Result<IndicatorSeries> {
    let (def, warmup) = resolve(spec)?;
    let lines = (def.compute)(series, &spec.params)
        .into_iter()
        .zip(def.lines)
        .map(|(values, name)| IndicatorLine {
            name: (*name).to_string(),
            values: values
                .into_iter()
                .map(|v| v.filter(|x| x.is_finite()))
                .collect(),
        })
        .collect();
    Ok(IndicatorSeries {
        spec: spec.clone(),
        warmup: warmup.min(series.len()),
        lines,
    })
}

/// Compute every spec in `specs`, in spec order. Failing specs are collected
/// in `failures` and do not affect the others.
pub fn compute(series: &PriceSeries, specs: &BTreeSet<IndicatorSpec>) -> IndicatorResults {
    let mut results = IndicatorResults::default();
    for spec in specs {
        match compute_one(series, spec) {
            Ok(out) => {
                debug!(spec = %spec, bars = series.len(), "indicator computed");
                results.series.insert(spec.clone(), out);
            }
            Err(err) => {
                warn!(spec = %spec, error = %err, "indicator skipped");
                results
                    .failures
                    .push(IndicatorFailure::from_error(&spec.to_string(), &err));
            }
        }
    }
    results
}
