use std::cmp::Ordering;

use crate::config::{MatchingConfig, ReconConfig};
use crate::model::{MatchCandidate, MatchReason, VehicleRecord};
use crate::normalize::{NormalizedPlate, Normalizer};

const SCORE_EXACT: f64 = 1.0;
const SCORE_PREFIX_VARIANT: f64 = 0.9;
const SCORE_DIGITS_SUBSET: f64 = 0.7;

/// Comparison keys derived once per plate.
#[derive(Debug, Clone)]
struct PlateKeys {
    value: String,
    core: String,
    digits: String,
    len: usize,
}

impl PlateKeys {
    fn new(plate: &NormalizedPlate, region_tokens: &[String]) -> Self {
        Self {
            value: plate.value.clone(),
            core: plate.core_value(region_tokens),
            digits: plate.value.chars().filter(|c| c.is_ascii_digit()).collect(),
            len: plate.value.chars().count(),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedVehicle {
    vehicle: VehicleRecord,
    keys: PlateKeys,
}

/// The vehicle set of one run, normalized once.
#[derive(Debug, Clone)]
pub struct PlateIndex {
    vehicles: Vec<IndexedVehicle>,
    region_tokens: Vec<String>,
}

impl PlateIndex {
    pub fn build(vehicles: &[VehicleRecord], normalizer: &Normalizer, region_tokens: &[String]) -> Self {
        let vehicles = vehicles
            .iter()
            .map(|v| IndexedVehicle {
                keys: PlateKeys::new(&normalizer.normalize(&v.plate_number), region_tokens),
                vehicle: v.clone(),
            })
            .collect();
        Self {
            vehicles,
            region_tokens: region_tokens.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Score `device` against every vehicle, best first, capped at `top_n`.
    /// Vehicles that qualify under no rule are left out entirely.
    pub fn candidates(&self, device: &NormalizedPlate, config: &MatchingConfig) -> Vec<MatchCandidate> {
        if device.is_empty() {
            return Vec::new();
        }
        let device_keys = PlateKeys::new(device, &self.region_tokens);

        let mut scored: Vec<(usize, MatchCandidate)> = self
            .vehicles
            .iter()
            .filter_map(|iv| {
                let (score, reason) = score_plate(&device_keys, &iv.keys, config.fuzzy_floor)?;
                let len_diff = device_keys.len.abs_diff(iv.keys.len);
                Some((
                    len_diff,
                    MatchCandidate {
                        vehicle_id: iv.vehicle.vehicle_id.clone(),
                        plate_number: iv.vehicle.plate_number.clone(),
                        score,
                        reason,
                    },
                ))
            })
            .collect();

        scored.sort_by(|(len_a, a), (len_b, b)| rank(a, *len_a, b, *len_b));
        scored.truncate(config.top_n);
        scored.into_iter().map(|(_, c)| c).collect()
    }
}

/// Score a device plate against an arbitrary vehicle list.
pub fn match_candidates(
    device: &NormalizedPlate,
    vehicles: &[VehicleRecord],
    config: &ReconConfig,
) -> Vec<MatchCandidate> {
    let normalizer = Normalizer::from_config(&config.normalizer);
    PlateIndex::build(vehicles, &normalizer, &config.normalizer.region_tokens)
        .candidates(device, &config.matching)
}

/// Score desc, then closer length, then vehicle id for determinism.
fn rank(a: &MatchCandidate, len_a: usize, b: &MatchCandidate, len_b: usize) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(len_a.cmp(&len_b))
        .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
}

/// Best qualifying rule for one vehicle. Earlier rules win ties.
fn score_plate(device: &PlateKeys, vehicle: &PlateKeys, fuzzy_floor: f64) -> Option<(f64, MatchReason)> {
    if vehicle.value.is_empty() {
        return None;
    }
    if device.value == vehicle.value {
        return Some((SCORE_EXACT, MatchReason::ExactMatch));
    }

    let mut best: Option<(f64, MatchReason)> = None;
    let mut offer = |score: f64, reason: MatchReason| {
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, reason));
        }
    };

    if !device.core.is_empty() && device.core == vehicle.core {
        offer(SCORE_PREFIX_VARIANT, MatchReason::PrefixVariant);
    }

    let similarity = similarity(&device.value, &vehicle.value);
    if similarity >= fuzzy_floor {
        offer(similarity, MatchReason::FuzzyMatch);
    }

    if is_subsequence(&device.digits, &vehicle.digits) {
        offer(SCORE_DIGITS_SUBSET, MatchReason::DigitsSubset);
    }

    best
}

/// Normalized Levenshtein similarity in `0.0..=1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max = a.chars().count().max(b.chars().count());
    if max == 0 {
        return 1.0;
    }
    (max - levenshtein(a, b)) as f64 / max as f64
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// True when every char of `needle` appears in `haystack` in order.
/// An empty needle never matches.
fn is_subsequence(needle: &str, haystack: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut hay = haystack.chars();
    needle.chars().all(|n| hay.any(|h| h == n))
}
