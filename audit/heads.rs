//! # Output Heads and Column Contract
//!
//! The model emits one scalar per head, six heads in a fixed order. The label
//! matrix carries the same six quantities shifted one column to the right,
//! because its first column is the `stay_id`:
//!
//! ```text
//! labels  : [stay_id, hosp, icu, los_icu, los_hosp, die_24h, leave_icu_24h]
//! outputs : [         hosp, icu, los_icu, los_hosp, die_24h, leave_icu_24h]
//! ```
//!
//! All code that slices prediction or label matrices goes through [`Head`]
//! so that the offset-by-one lives in exactly one place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of model output columns.
pub const NUM_OUTPUTS: usize = 6;

/// Number of label columns (`stay_id` plus one per head).
pub const NUM_LABEL_COLUMNS: usize = NUM_OUTPUTS + 1;

/// Label column that holds the stay identifier.
pub const STAY_ID_COLUMN: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Head {
    /// In-hospital mortality.
    #[value(name = "hosp")]
    HospitalMortality,
    /// ICU mortality.
    #[value(name = "icu")]
    IcuMortality,
    /// ICU length of stay in days (regression).
    #[value(name = "los-icu")]
    IcuLengthOfStay,
    /// Hospital length of stay in days (regression).
    #[value(name = "los-hosp")]
    HospitalLengthOfStay,
    /// Death within the next 24 hours.
    #[value(name = "die-24")]
    DieWithin24h,
    /// ICU discharge within the next 24 hours.
    #[value(name = "alive-24")]
    LeaveIcuWithin24h,
}

impl Head {
    /// Every head in output-column order.
    pub const ALL: [Head; NUM_OUTPUTS] = [
        Head::HospitalMortality,
        Head::IcuMortality,
        Head::IcuLengthOfStay,
        Head::HospitalLengthOfStay,
        Head::DieWithin24h,
        Head::LeaveIcuWithin24h,
    ];

    /// The binary heads that take part in the loss and in every report.
    pub const ACTIVE: [Head; 4] = [
        Head::HospitalMortality,
        Head::IcuMortality,
        Head::DieWithin24h,
        Head::LeaveIcuWithin24h,
    ];

    /// Column of this head in the `[N x 6]` prediction matrix.
    pub const fn output_column(self) -> usize {
        match self {
            Head::HospitalMortality => 0,
            Head::IcuMortality => 1,
            Head::IcuLengthOfStay => 2,
            Head::HospitalLengthOfStay => 3,
            Head::DieWithin24h => 4,
            Head::LeaveIcuWithin24h => 5,
        }
    }

    /// Column of this head in the `[N x 7]` label matrix.
    pub const fn label_column(self) -> usize {
        self.output_column() + 1
    }

    pub const fn is_active(self) -> bool {
        !matches!(self, Head::IcuLengthOfStay | Head::HospitalLengthOfStay)
    }

    /// Short name used in file names and log lines.
    pub const fn short_name(self) -> &'static str {
        match self {
            Head::HospitalMortality => "hosp",
            Head::IcuMortality => "icu",
            Head::IcuLengthOfStay => "los_icu",
            Head::HospitalLengthOfStay => "los_hosp",
            Head::DieWithin24h => "24hr_die",
            Head::LeaveIcuWithin24h => "24hr_alive",
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_column_is_output_column_plus_one() {
        for head in Head::ALL {
            assert_eq!(head.label_column(), head.output_column() + 1);
            assert!(head.label_column() < NUM_LABEL_COLUMNS);
        }
    }

    #[test]
    fn active_heads_exclude_length_of_stay() {
        let active: Vec<usize> = Head::ACTIVE.iter().map(|h| h.output_column()).collect();
        assert_eq!(active, vec![0, 1, 4, 5]);
        assert!(!Head::IcuLengthOfStay.is_active());
        assert!(!Head::HospitalLengthOfStay.is_active());
        assert!(Head::ACTIVE.iter().all(|h| h.is_active()));
    }

    #[test]
    fn all_heads_are_in_output_order() {
        for (i, head) in Head::ALL.iter().enumerate() {
            assert_eq!(head.output_column(), i);
        }
    }
}
