use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stat::Snapshot;

/// Metric a threshold is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Wall-clock duration of executed iterations.
    IterationDuration,
    /// Share of executed iterations that failed.
    IterationFailed,
}

impl Metric {
    #[inline]
    fn as_str(&self) -> &'static str {
        match self {
            Self::IterationDuration => "iteration_duration",
            Self::IterationFailed => "iteration_failed",
        }
    }
}

/// Aggregation applied to the metric before comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Nearest-rank percentile of durations, in milliseconds.
    Percentile(f64),
    /// Failure rate, a fraction within [0; 1].
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    #[inline]
    fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    #[inline]
    fn compare(&self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdParseError {
    #[error("expected '<metric>{{scenario:<tag>}}:<aggregation><comparator><limit>'")]
    Syntax,
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("unknown aggregation '{0}'")]
    UnknownAggregation(String),
    #[error("percentile must be within [0; 100], got {0}")]
    PercentileRange(f64),
    #[error("aggregation '{aggregation}' cannot apply to metric '{metric}'")]
    Incompatible { metric: String, aggregation: String },
    #[error("invalid tag filter '{0}'")]
    TagFilter(String),
    #[error("invalid limit '{0}'")]
    Limit(String),
}

/// A service-level condition over an aggregated metric.
///
/// Thresholds are written (and serialized) as compact expressions in the
/// `<metric>{scenario:<tag>}:<aggregation><comparator><limit>` form, with the
/// tag filter optional:
///
/// - `iteration_duration{scenario:main}:p(99.99)<50`: the 99.99th duration
///   percentile of the "main" series must stay below 50 ms;
/// - `iteration_failed:rate<0.0001`: the overall failure rate must stay
///   below 0.01%.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThresholdSpec {
    pub metric: Metric,
    /// Restricts evaluation to the series with this scenario tag.
    pub tag: Option<String>,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub limit: f64,
}

impl FromStr for ThresholdSpec {
    type Err = ThresholdParseError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let v = v.trim();

        // The tag filter may itself contain ':', so the expression separator
        // is the first ':' past the closing brace, if any.
        let (target, expr) = match v.find('}') {
            Some(end) => {
                let expr = v[end + 1..].strip_prefix(':').ok_or(ThresholdParseError::Syntax)?;
                (&v[..=end], expr)
            }
            None => v.split_once(':').ok_or(ThresholdParseError::Syntax)?,
        };

        let (metric, tag) = match target.split_once('{') {
            Some((metric, filter)) => {
                let filter = filter.strip_suffix('}').ok_or(ThresholdParseError::Syntax)?;
                (metric, Some(parse_tag_filter(filter)?))
            }
            None => (target, None),
        };

        let metric = match metric {
            "iteration_duration" => Metric::IterationDuration,
            "iteration_failed" => Metric::IterationFailed,
            v => return Err(ThresholdParseError::UnknownMetric(v.into())),
        };

        let idx = expr.find(['<', '>']).ok_or(ThresholdParseError::Syntax)?;
        let (aggregation, rest) = expr.split_at(idx);

        let aggregation = parse_aggregation(aggregation.trim())?;
        match (metric, aggregation) {
            (Metric::IterationDuration, Aggregation::Percentile(..)) => {}
            (Metric::IterationFailed, Aggregation::Rate) => {}
            (metric, ..) => {
                return Err(ThresholdParseError::Incompatible {
                    metric: metric.as_str().into(),
                    aggregation: aggregation.to_string(),
                })
            }
        }

        let (comparator, limit) = if let Some(limit) = rest.strip_prefix("<=") {
            (Comparator::Le, limit)
        } else if let Some(limit) = rest.strip_prefix(">=") {
            (Comparator::Ge, limit)
        } else if let Some(limit) = rest.strip_prefix('<') {
            (Comparator::Lt, limit)
        } else {
            (Comparator::Gt, &rest[1..])
        };

        let limit: f64 = limit
            .trim()
            .parse()
            .map_err(|_| ThresholdParseError::Limit(limit.trim().into()))?;

        let m = Self {
            metric,
            tag,
            aggregation,
            comparator,
            limit,
        };

        Ok(m)
    }
}

fn parse_tag_filter(v: &str) -> Result<String, ThresholdParseError> {
    let tag = match v.split_once(':') {
        Some(("scenario", tag)) => tag,
        Some(..) => return Err(ThresholdParseError::TagFilter(v.into())),
        None => v,
    };
    if tag.is_empty() {
        return Err(ThresholdParseError::TagFilter(v.into()));
    }

    Ok(tag.into())
}

fn parse_aggregation(v: &str) -> Result<Aggregation, ThresholdParseError> {
    if v == "rate" {
        return Ok(Aggregation::Rate);
    }

    let q = v
        .strip_prefix("p(")
        .and_then(|v| v.strip_suffix(')'))
        .and_then(|q| q.trim().parse::<f64>().ok())
        .ok_or_else(|| ThresholdParseError::UnknownAggregation(v.into()))?;
    if !(0.0..=100.0).contains(&q) {
        return Err(ThresholdParseError::PercentileRange(q));
    }

    Ok(Aggregation::Percentile(q))
}

impl Display for Aggregation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentile(q) => write!(fmt, "p({q})"),
            Self::Rate => fmt.write_str("rate"),
        }
    }
}

impl Display for ThresholdSpec {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.metric.as_str())?;
        if let Some(tag) = &self.tag {
            write!(fmt, "{{scenario:{tag}}}")?;
        }
        write!(fmt, ":{}{}{}", self.aggregation, self.comparator.as_str(), self.limit)
    }
}

impl TryFrom<String> for ThresholdSpec {
    type Error = ThresholdParseError;

    fn try_from(v: String) -> Result<Self, Self::Error> {
        v.parse()
    }
}

impl From<ThresholdSpec> for String {
    fn from(v: ThresholdSpec) -> Self {
        v.to_string()
    }
}

/// Verdict of one threshold against one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    #[serde(rename = "threshold")]
    pub spec: ThresholdSpec,
    /// The aggregated value the comparison ran against. [`None`] means the
    /// matching series was empty (insufficient data).
    pub observed: Option<f64>,
    pub passed: bool,
}

impl ThresholdVerdict {
    /// Evaluates the threshold against the snapshot.
    ///
    /// Pure function of its inputs: the same spec and snapshot always yield
    /// the same verdict, so callers may re-evaluate mid-run as often as they
    /// like. A threshold whose matching series is empty fails: silently
    /// passing a run that produced no data would hide a broken scenario.
    pub fn evaluate(spec: &ThresholdSpec, snapshot: &Snapshot) -> Self {
        let tag = spec.tag.as_deref();
        let observed = match spec.aggregation {
            Aggregation::Percentile(q) => snapshot.percentile_ms(tag, q),
            Aggregation::Rate => snapshot.failure_rate(tag),
        };
        let passed = observed.map_or(false, |v| spec.comparator.compare(v, spec.limit));

        Self {
            spec: spec.clone(),
            observed,
            passed,
        }
    }

    /// Whether this verdict failed because no iteration matched the filter.
    #[inline]
    pub fn is_insufficient_data(&self) -> bool {
        self.observed.is_none()
    }
}

/// Overall verdict of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunVerdict {
    pub thresholds: Vec<ThresholdVerdict>,
    /// A fatal execution error, if one occurred. Fails the run regardless of
    /// threshold outcomes.
    pub fatal: Option<String>,
    pub passed: bool,
}

impl RunVerdict {
    pub fn evaluate(specs: &[ThresholdSpec], snapshot: &Snapshot, fatal: Option<String>) -> Self {
        let thresholds: Vec<ThresholdVerdict> = specs
            .iter()
            .map(|spec| ThresholdVerdict::evaluate(spec, snapshot))
            .collect();
        let passed = fatal.is_none() && thresholds.iter().all(|v| v.passed);

        Self { thresholds, fatal, passed }
    }
}
