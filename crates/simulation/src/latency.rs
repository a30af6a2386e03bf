//! Link latency and per-event processing time for timed runs.

use crate::SimulationError;
use pathcheck_types::NodeIndex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Propagation delay without link parameters, in microseconds.
pub const DEFAULT_LINK_LATENCY: u64 = 1000;

/// Link bitrate without link parameters, in bits per second.
pub const DEFAULT_BITRATE: u64 = 8_000_000;

/// Processing time of an event with no known distribution, in microseconds.
pub const DEFAULT_PROCESSING_TIME: u64 = 10_000;

/// Upper bound of the queueing jitter per started 1500-byte segment.
const JITTER_CAP_PER_SEGMENT: u64 = 60_000_000;

/// Pareto shape of the queueing jitter.
const JITTER_SHAPE: f64 = 3.0;

/// Per-group-pair bandwidth and latency, loaded from a link-parameter file.
///
/// File layout, whitespace separated:
///
/// ```text
/// <num nodes> <num groups>
/// <count> <node> <node> ...        one line per group
/// <num groups x num groups bandwidth matrix, kbps>
/// <num groups x num groups latency matrix, ms>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    groups: Vec<usize>,
    /// Bits per second.
    bitrate: Vec<Vec<u64>>,
    /// Microseconds.
    latency: Vec<Vec<u64>>,
}

impl LinkParams {
    /// Parse link parameters. Matrix entries are floored at 1 and must fit
    /// in a `u64` once scaled to bits per second and microseconds.
    pub fn parse(text: &str) -> Result<Self, SimulationError> {
        let mut tokens = text.split_whitespace().map(|t| {
            t.parse::<u64>()
                .map_err(|_| SimulationError::LinkParams(format!("not a number: {t:?}")))
        });
        let mut next = |what: &str| -> Result<u64, SimulationError> {
            tokens
                .next()
                .unwrap_or_else(|| Err(SimulationError::LinkParams(format!("missing {what}"))))
        };

        let num_nodes = next("node count")? as usize;
        let num_groups = next("group count")? as usize;
        if num_nodes == 0 || num_groups == 0 {
            return Err(SimulationError::LinkParams(
                "node and group counts must be positive".into(),
            ));
        }

        let mut groups: Vec<Option<usize>> = vec![None; num_nodes];
        for group in 0..num_groups {
            let members = next("group size")?;
            for _ in 0..members {
                let node = next("group member")? as usize;
                let slot = groups.get_mut(node).ok_or_else(|| {
                    SimulationError::LinkParams(format!("node {node} out of range"))
                })?;
                *slot = Some(group);
            }
        }
        let groups = groups
            .into_iter()
            .enumerate()
            .map(|(node, g)| {
                g.ok_or_else(|| SimulationError::LinkParams(format!("node {node} has no group")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut matrix = |what: &str| -> Result<Vec<Vec<u64>>, SimulationError> {
            (0..num_groups)
                .map(|_| {
                    (0..num_groups)
                        .map(|_| {
                            let v = next(what)?.max(1);
                            v.checked_mul(1000).ok_or_else(|| {
                                SimulationError::InvalidParams(format!("{what} {v} is too large"))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect()
        };
        let bitrate = matrix("bandwidth")?;
        let latency = matrix("latency")?;

        Ok(Self {
            groups,
            bitrate,
            latency,
        })
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    fn group(&self, node: NodeIndex) -> Result<usize, SimulationError> {
        self.groups
            .get(node as usize)
            .copied()
            .ok_or_else(|| SimulationError::LinkParams(format!("node {node} has no group")))
    }

    /// Propagation delay between two nodes, in microseconds.
    pub fn latency(&self, src: NodeIndex, dest: NodeIndex) -> Result<u64, SimulationError> {
        Ok(self.latency[self.group(src)?][self.group(dest)?])
    }

    /// Link bitrate between two nodes, in bits per second.
    pub fn bitrate(&self, src: NodeIndex, dest: NodeIndex) -> Result<u64, SimulationError> {
        Ok(self.bitrate[self.group(src)?][self.group(dest)?])
    }
}

/// Message latency model.
#[derive(Debug, Clone, Default)]
pub struct LatencyModel {
    links: Option<LinkParams>,
}

impl LatencyModel {
    /// Model with default latency and bitrate on every link.
    pub fn new() -> Self {
        Self::default()
    }

    /// Model driven by link parameters.
    pub fn with_links(links: LinkParams) -> Self {
        Self { links: Some(links) }
    }

    /// Load link parameters if a file is configured.
    pub fn from_file(path: Option<&Path>) -> Result<Self, SimulationError> {
        match path {
            Some(path) => {
                let links = LinkParams::load(path)?;
                info!(path = %path.display(), groups = links.latency.len(), "Loaded link parameters");
                Ok(Self::with_links(links))
            }
            None => Ok(Self::new()),
        }
    }

    /// Propagation delay between two nodes, in microseconds.
    pub fn fixed_latency(&self, src: NodeIndex, dest: NodeIndex) -> Result<u64, SimulationError> {
        match &self.links {
            Some(links) => links.latency(src, dest),
            None => Ok(DEFAULT_LINK_LATENCY),
        }
    }

    /// Link bitrate between two nodes, in bits per second.
    pub fn bitrate(&self, src: NodeIndex, dest: NodeIndex) -> Result<u64, SimulationError> {
        match &self.links {
            Some(links) => links.bitrate(src, dest),
            None => Ok(DEFAULT_BITRATE),
        }
    }

    /// Transmission delay of `size` bytes sharing the link with `flows` flows.
    pub fn transmission_delay(&self, size: usize, flows: usize, bitrate: u64) -> u64 {
        let flows = flows.max(1) as u64;
        let bits = flows.saturating_mul(size as u64).saturating_mul(8);
        (u128::from(bits) * 1_000_000 / u128::from(bitrate.max(1))).min(u64::MAX as u128) as u64
    }

    /// Pareto-distributed queueing jitter, capped per started 1500-byte segment.
    ///
    /// `fraction` is a uniform variate in `[0, 1)`.
    pub fn jitter(&self, link_latency: u64, size: usize, fraction: f64) -> u64 {
        let u = fraction.clamp(0.0, 1.0 - f64::EPSILON);
        let raw = link_latency as f64 / (1.0 - u).powf(1.0 / JITTER_SHAPE);
        let segments = size.div_ceil(1500).max(1) as u64;
        let cap = JITTER_CAP_PER_SEGMENT * segments;
        if raw >= cap as f64 {
            cap
        } else {
            raw as u64
        }
    }

    /// Total latency of a `size`-byte message from `src` to `dest`.
    pub fn latency(
        &self,
        src: NodeIndex,
        dest: NodeIndex,
        size: usize,
        flows: usize,
        fraction: f64,
    ) -> Result<u64, SimulationError> {
        let link_latency = self.fixed_latency(src, dest)?;
        let bitrate = self.bitrate(src, dest)?;
        Ok(self
            .transmission_delay(size, flows, bitrate)
            .saturating_add(self.jitter(link_latency, size, fraction)))
    }
}

/// Named, evenly spaced empirical distributions of event processing time.
///
/// File layout: a sequence of blocks `<name> <count>` followed by `count`
/// non-decreasing values in microseconds.
#[derive(Debug, Clone, Default)]
pub struct LatencyDistributions {
    distributions: HashMap<String, Vec<u64>>,
}

impl LatencyDistributions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a distribution file.
    pub fn parse(text: &str) -> Result<Self, SimulationError> {
        let mut distributions = HashMap::new();
        let mut tokens = text.split_whitespace();
        while let Some(name) = tokens.next() {
            let count: usize = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| SimulationError::Distribution(format!("{name}: missing count")))?;
            if count == 0 {
                return Err(SimulationError::Distribution(format!("{name}: empty")));
            }
            let values = (0..count)
                .map(|_| {
                    tokens.next().and_then(|t| t.parse::<u64>().ok()).ok_or_else(|| {
                        SimulationError::Distribution(format!("{name}: expected {count} values"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if values.windows(2).any(|w| w[1] < w[0]) {
                return Err(SimulationError::Distribution(format!(
                    "{name}: values must be non-decreasing"
                )));
            }
            distributions.insert(name.to_string(), values);
        }
        Ok(Self { distributions })
    }

    /// Load from a file if configured; empty otherwise.
    pub fn from_file(path: Option<&Path>) -> Result<Self, SimulationError> {
        match path {
            Some(path) => {
                let dists = Self::parse(&fs::read_to_string(path)?)?;
                info!(count = dists.len(), "Loaded latency distributions");
                Ok(dists)
            }
            None => Ok(Self::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }

    /// Value at `fraction` of the named distribution by linear interpolation.
    ///
    /// Unknown names log a warning and yield [`DEFAULT_PROCESSING_TIME`].
    pub fn evaluate(&self, name: &str, fraction: f64) -> u64 {
        let Some(values) = self.distributions.get(name) else {
            warn!(event = name, "Distribution not known, assuming 10ms");
            return DEFAULT_PROCESSING_TIME;
        };
        let frac = fraction.clamp(0.0, 1.0);
        let last = values.len() - 1;
        let lower = ((frac * last as f64).floor() as usize).min(last);
        if lower == last {
            return values[last];
        }
        let increment = 1.0 / last as f64;
        let lower_frac = increment * lower as f64;
        let (low, high) = (values[lower], values[lower + 1]);
        low + ((frac - lower_frac) / increment * (high - low) as f64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_latency_of_one_segment() {
        let model = LatencyModel::new();
        assert_eq!(model.transmission_delay(1500, 1, DEFAULT_BITRATE), 1500);
        assert_eq!(model.transmission_delay(1500, 0, DEFAULT_BITRATE), 1500);
        assert_eq!(model.transmission_delay(1500, 2, DEFAULT_BITRATE), 3000);
    }

    #[test]
    fn test_jitter_is_pareto_bounded() {
        let model = LatencyModel::new();
        // u = 0 gives the scale parameter itself.
        assert_eq!(model.jitter(1000, 1500, 0.0), 1000);
        // The tail is clamped to 60s per started segment.
        assert_eq!(model.jitter(1000, 1500, 1.0), 60_000_000);
        assert_eq!(model.jitter(1000, 1501, 1.0), 120_000_000);
        for i in 0..100 {
            let j = model.jitter(1000, 1500, i as f64 / 100.0);
            assert!((1000..=60_000_000).contains(&j));
        }
    }

    #[test]
    fn test_total_latency_default_link() {
        let model = LatencyModel::new();
        assert_eq!(model.latency(0, 1, 1500, 1, 0.0).unwrap(), 2500);
    }

    #[test]
    fn test_link_params_lookup() {
        let text = "3 2\n2 0 1\n1 2\n8000 1000\n1000 0\n1 50\n50 1\n";
        let links = LinkParams::parse(text).unwrap();
        assert_eq!(links.latency(0, 1).unwrap(), 1000);
        assert_eq!(links.latency(0, 2).unwrap(), 50_000);
        assert_eq!(links.bitrate(0, 1).unwrap(), 8_000_000);
        // Zero bandwidth is floored at 1 kbps.
        assert_eq!(links.bitrate(2, 2).unwrap(), 1000);

        let model = LatencyModel::with_links(links);
        assert_eq!(model.fixed_latency(1, 2).unwrap(), 50_000);
    }

    #[test]
    fn test_link_params_rejects_incomplete_groups() {
        assert!(matches!(
            LinkParams::parse("2 1\n1 0\n5\n5\n"),
            Err(SimulationError::LinkParams(_))
        ));
        assert!(LinkParams::parse("2 1\n2 0 1\n5\n").is_err());
    }

    #[test]
    fn test_link_params_rejects_unscalable_entries() {
        let huge = u64::MAX / 1000 + 1;
        assert!(matches!(
            LinkParams::parse(&format!("1 1\n1 0\n8000\n{huge}\n")),
            Err(SimulationError::InvalidParams(_))
        ));
        assert!(matches!(
            LinkParams::parse(&format!("1 1\n1 0\n{huge}\n50\n")),
            Err(SimulationError::InvalidParams(_))
        ));
        let edge = u64::MAX / 1000;
        let links = LinkParams::parse(&format!("1 1\n1 0\n8000\n{edge}\n")).unwrap();
        assert_eq!(links.latency(0, 0).unwrap(), edge * 1000);
    }

    #[test]
    fn test_distribution_interpolation() {
        let dists = LatencyDistributions::parse("TIMER 3 100 200 400\n").unwrap();
        assert_eq!(dists.evaluate("TIMER", 0.0), 100);
        assert_eq!(dists.evaluate("TIMER", 0.25), 150);
        assert_eq!(dists.evaluate("TIMER", 0.75), 300);
        assert_eq!(dists.evaluate("TIMER", 1.0), 400);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_unknown_distribution_defaults() {
        let dists = LatencyDistributions::new();
        assert_eq!(dists.evaluate("NETWORK::MESSAGE", 0.5), DEFAULT_PROCESSING_TIME);
        assert!(logs_contain("Distribution not known"));
    }
}
