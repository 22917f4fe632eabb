//! Plan numbers and plan identity.
//!
//! Plan numbers are strings such as `01`, `5.1`, `00` or `100`. They sort
//! segment-wise by numeric value, so `5.1 < 5.2 < 10`. Two bands are reserved:
//! `00` for decision-checkpoint plans (run first in a phase) and `99` and above
//! for manual and verification plans (run last).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Plan number reserved for the bundled decisions plan.
pub const DECISIONS_PLAN: &str = "00";
/// Plan number reserved for the bundled manual-tasks plan.
pub const MANUAL_PLAN: &str = "99";
/// Plan number reserved for the bundled verification plan.
pub const VERIFICATION_PLAN: &str = "100";

/// First segment value of the trailing reserved band.
const LATE_BAND_START: u32 = 99;

/// Parsed plan number (`5.1` → `[5, 1]`), keeping the original spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanNumber {
    raw: String,
    segments: Vec<u32>,
}

impl PlanNumber {
    /// Parse a plan number. Segments must be non-empty ASCII digit runs separated by `.`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            segments.push(part.parse().ok()?);
        }
        Some(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True for the `00` decision-checkpoint band.
    pub fn is_decisions_band(&self) -> bool {
        self.segments.first() == Some(&0)
    }

    /// True for the `99`+ manual/verification band.
    pub fn is_late_band(&self) -> bool {
        self.segments
            .first()
            .is_some_and(|first| *first >= LATE_BAND_START)
    }

    /// Ordinary plans are everything outside both reserved bands.
    pub fn is_ordinary(&self) -> bool {
        !self.is_decisions_band() && !self.is_late_band()
    }
}

impl Ord for PlanNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .cmp(&other.segments)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for PlanNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PlanNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Identity of a plan across the ledger: phase number plus plan number.
///
/// Rendered as `NN-PP` (`03-01`, `05-5.1`), which is also the file-name stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PlanId {
    pub phase: u32,
    pub number: PlanNumber,
}

impl PlanId {
    pub fn new(phase: u32, number: PlanNumber) -> Self {
        Self { phase, number }
    }

    /// Build from a phase and a raw plan number string.
    pub fn parse_parts(phase: u32, number: &str) -> Option<Self> {
        PlanNumber::parse(number).map(|number| Self { phase, number })
    }

    /// Parse the `NN-PP` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let (phase, number) = raw.split_once('-')?;
        let phase: u32 = phase.parse().ok()?;
        Self::parse_parts(phase, number)
    }

    /// File-name stem, e.g. `03-01`.
    pub fn stem(&self) -> String {
        format!("{:02}-{}", self.phase, self.number)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{}", self.phase, self.number)
    }
}

impl From<PlanId> for String {
    fn from(id: PlanId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PlanId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PlanId::parse(&value).ok_or_else(|| format!("invalid plan id '{value}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(raw: &str) -> PlanNumber {
        PlanNumber::parse(raw).expect("plan number")
    }

    #[test]
    fn decimal_sub_numbers_sort_numerically() {
        let mut numbers = vec![num("10"), num("5.2"), num("02"), num("5.1"), num("5")];
        numbers.sort();
        let raw: Vec<&str> = numbers.iter().map(PlanNumber::as_str).collect();
        assert_eq!(raw, vec!["02", "5", "5.1", "5.2", "10"]);
    }

    #[test]
    fn reserved_bands_bracket_ordinary_plans() {
        let mut numbers = vec![num("100"), num("03"), num("99"), num("00"), num("01")];
        numbers.sort();
        let raw: Vec<&str> = numbers.iter().map(PlanNumber::as_str).collect();
        assert_eq!(raw, vec!["00", "01", "03", "99", "100"]);
        assert!(num("00").is_decisions_band());
        assert!(num("99").is_late_band());
        assert!(num("100").is_late_band());
        assert!(num("98.5").is_ordinary());
    }

    #[test]
    fn rejects_malformed_numbers() {
        for raw in ["", "a", "1.", ".1", "1..2", "-1", "1.x"] {
            assert!(PlanNumber::parse(raw).is_none(), "accepted '{raw}'");
        }
    }

    #[test]
    fn plan_id_parses_and_renders_stem() {
        let id = PlanId::parse("03-5.1").expect("id");
        assert_eq!(id.phase, 3);
        assert_eq!(id.number.as_str(), "5.1");
        assert_eq!(id.stem(), "03-5.1");
        assert_eq!(PlanId::parse_parts(12, "01").expect("id").to_string(), "12-01");
    }

    #[test]
    fn plan_ids_order_by_phase_then_number() {
        let mut ids = vec![
            PlanId::parse("02-01").expect("id"),
            PlanId::parse("01-99").expect("id"),
            PlanId::parse("01-00").expect("id"),
            PlanId::parse("01-02").expect("id"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["01-00", "01-02", "01-99", "02-01"]);
    }
}
