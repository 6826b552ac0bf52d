//! Numeric value ranges with independently inclusive or exclusive bounds.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl DataRange {
    /// Closed range `[min..max]`.
    pub const fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    /// `>= min`
    pub const fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    /// `<= max`
    pub const fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    pub const fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    pub const fn exclusive_min(mut self) -> Self {
        self.min_inclusive = false;
        self
    }

    pub const fn exclusive_max(mut self) -> Self {
        self.max_inclusive = false;
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let above_min = match self.min {
            Some(min) if self.min_inclusive => value >= min,
            Some(min) => value > min,
            None => true,
        };
        let below_max = match self.max {
            Some(max) if self.max_inclusive => value <= max,
            Some(max) => value < max,
            None => true,
        };
        above_min && below_max
    }

    /// Pulls `value` onto the nearest bound. Exclusive bounds clamp to the bound itself.
    pub fn clamp(&self, value: f64) -> f64 {
        let mut clamped = value;
        if let Some(min) = self.min {
            clamped = clamped.max(min);
        }
        if let Some(max) = self.max {
            clamped = clamped.min(max);
        }
        clamped
    }
}

impl fmt::Display for DataRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => {
                let open = if self.min_inclusive { '[' } else { '(' };
                let close = if self.max_inclusive { ']' } else { ')' };
                write!(f, "{open}{min}..{max}{close}")
            }
            (Some(min), None) => {
                let op = if self.min_inclusive { ">=" } else { ">" };
                write!(f, "{op} {min}")
            }
            (None, Some(max)) => {
                let op = if self.max_inclusive { "<=" } else { "<" };
                write!(f, "{op} {max}")
            }
            (None, None) => f.write_str("(..)"),
        }
    }
}
