#![forbid(unsafe_code)]

//! Write helpers: limiting, checking and related metadata.
//!
//! A writable container may carry one [`Helper`]. Before a value is committed
//! the helper's [`limit`](Helper::limit) adjusts it (or rejects it with
//! `None`); UIs call [`check`](Helper::check) to explain why a value would be
//! adjusted, and [`related`](Helper::related) to learn the allowed range,
//! unit or enumeration entries.
//!
//! Three stock helpers cover the common field types:
//!
//! | Helper | Value | Limits | Related |
//! |---|---|---|---|
//! | [`NumberHelper`] | `f64` | step rounding, then `min`/`max` clamp | [`Related::Number`] |
//! | [`TextHelper`] | `String` | char count, then UTF-8 byte count | [`Related::Text`] |
//! | [`EnumHelper<K>`] | `K` | none | [`Related::Enum`] |

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Validation and clamping strategy for written values.
pub trait Helper<W> {
    /// Adjust `value` to the allowed domain, or `None` to reject it.
    fn limit(&self, value: &W) -> Option<W>;

    /// Explain why `value` is outside the allowed domain.
    fn check(&self, value: &W) -> Option<String>;

    /// Metadata describing the allowed domain.
    fn related(&self) -> Option<Related> {
        None
    }
}

// ---------------------------------------------------------------------------
// Related metadata
// ---------------------------------------------------------------------------

/// One entry of an enumeration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumEntry {
    /// Key as it appears in the stored value.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
}

impl EnumEntry {
    /// Create an entry without description.
    #[must_use]
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Side-channel metadata a container exposes through `related()`.
#[derive(Clone)]
pub enum Related {
    Number {
        min: Option<f64>,
        max: Option<f64>,
        unit: Option<String>,
        decimals: Option<u32>,
        step: Option<f64>,
        start: Option<f64>,
    },
    Text {
        max_length: Option<usize>,
        max_bytes: Option<usize>,
    },
    Enum {
        entries: Vec<EnumEntry>,
    },
    /// Application-defined metadata; compared by pointer.
    Custom(Rc<dyn Any>),
}

impl fmt::Debug for Related {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number {
                min,
                max,
                unit,
                decimals,
                step,
                start,
            } => f
                .debug_struct("Number")
                .field("min", min)
                .field("max", max)
                .field("unit", unit)
                .field("decimals", decimals)
                .field("step", step)
                .field("start", start)
                .finish(),
            Self::Text {
                max_length,
                max_bytes,
            } => f
                .debug_struct("Text")
                .field("max_length", max_length)
                .field("max_bytes", max_bytes)
                .finish(),
            Self::Enum { entries } => f.debug_struct("Enum").field("entries", entries).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for Related {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Number {
                    min: a0,
                    max: a1,
                    unit: a2,
                    decimals: a3,
                    step: a4,
                    start: a5,
                },
                Self::Number {
                    min: b0,
                    max: b1,
                    unit: b2,
                    decimals: b3,
                    step: b4,
                    start: b5,
                },
            ) => a0 == b0 && a1 == b1 && a2 == b2 && a3 == b3 && a4 == b4 && a5 == b5,
            (
                Self::Text {
                    max_length: a0,
                    max_bytes: a1,
                },
                Self::Text {
                    max_length: b0,
                    max_bytes: b1,
                },
            ) => a0 == b0 && a1 == b1,
            (Self::Enum { entries: a }, Self::Enum { entries: b }) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// NumberHelper
// ---------------------------------------------------------------------------

/// Number of fractional digits in the shortest representation of `value`.
fn fraction_digits(value: f64) -> u32 {
    let text = value.to_string();
    text.split_once('.')
        .map_or(0, |(_, fraction)| fraction.len() as u32)
}

/// Limiter for numeric fields.
///
/// When `step` is set, values snap to `start + k * step` (rounded to
/// `decimals`) before being clamped into `[min, max]`. If `decimals` is not
/// given explicitly it is derived from the precision of `step` and `start`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumberHelper {
    min: Option<f64>,
    max: Option<f64>,
    unit: Option<String>,
    decimals: Option<u32>,
    explicit_decimals: bool,
    step: Option<f64>,
    start: Option<f64>,
}

impl NumberHelper {
    /// Unbounded helper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper clamping into `[min, max]`.
    #[must_use]
    pub fn range(min: f64, max: f64) -> Self {
        Self::new().with_min(min).with_max(max)
    }

    #[must_use]
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Suggested number of decimals; overrides the value derived from `step`.
    #[must_use]
    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self.explicit_decimals = true;
        self
    }

    /// Allowed step size: `0.1` allows `0, 0.1, 0.2, ...`.
    #[must_use]
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self.derive_decimals();
        self
    }

    /// Offset for `step`: start `0.5` with step `2` allows `0.5, 2.5, 4.5, ...`.
    #[must_use]
    pub fn with_start(mut self, start: f64) -> Self {
        self.start = Some(start);
        self.derive_decimals();
        self
    }

    fn derive_decimals(&mut self) {
        if self.explicit_decimals {
            return;
        }
        let Some(step) = self.step else {
            return;
        };
        let digits = fraction_digits(step).max(self.start.map_or(0, fraction_digits));
        self.decimals = Some(digits);
    }

    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    #[must_use]
    pub fn decimals(&self) -> Option<u32> {
        self.decimals
    }

    fn snap(&self, value: f64) -> f64 {
        let Some(step) = self.step.filter(|s| *s != 0.0 && s.is_finite()) else {
            return value;
        };
        let start = self.start.unwrap_or(0.0);
        let snapped = ((value - start + f64::EPSILON) / step).round() * step + start;
        match self.decimals {
            Some(decimals) => {
                let scale = 10f64.powi(decimals.min(15) as i32);
                (snapped * scale).round() / scale
            }
            None => snapped,
        }
    }
}

impl Helper<f64> for NumberHelper {
    fn limit(&self, value: &f64) -> Option<f64> {
        let mut value = self.snap(*value);
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        Some(value)
    }

    fn check(&self, value: &f64) -> Option<String> {
        if let Some(max) = self.max
            && *value > max
        {
            return Some(format!("{value} is bigger than the limit of {max}"));
        }
        if let Some(min) = self.min
            && *value < min
        {
            return Some(format!("{value} is smaller than the limit of {min}"));
        }
        None
    }

    fn related(&self) -> Option<Related> {
        Some(Related::Number {
            min: self.min,
            max: self.max,
            unit: self.unit.clone(),
            decimals: self.decimals,
            step: self.step,
            start: self.start,
        })
    }
}

// ---------------------------------------------------------------------------
// TextHelper
// ---------------------------------------------------------------------------

/// Limiter for text fields, by character count and by UTF-8 byte count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextHelper {
    max_length: Option<usize>,
    max_bytes: Option<usize>,
}

impl TextHelper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of characters.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Maximum number of UTF-8 bytes.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

impl Helper<String> for TextHelper {
    fn limit(&self, value: &String) -> Option<String> {
        let mut text: &str = value;
        if let Some(max) = self.max_length
            && let Some((cut, _)) = text.char_indices().nth(max)
        {
            text = &text[..cut];
        }
        if let Some(max) = self.max_bytes
            && text.len() > max
        {
            // Never split a code point.
            let mut cut = max;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text = &text[..cut];
        }
        Some(text.to_owned())
    }

    fn check(&self, value: &String) -> Option<String> {
        if let Some(max) = self.max_length
            && value.chars().count() > max
        {
            return Some(format!(
                "the text is longer than the limit of {max} characters"
            ));
        }
        if let Some(max) = self.max_bytes
            && value.len() > max
        {
            return Some(format!("the text is longer than the limit of {max} bytes"));
        }
        None
    }

    fn related(&self) -> Option<Related> {
        Some(Related::Text {
            max_length: self.max_length,
            max_bytes: self.max_bytes,
        })
    }
}

// ---------------------------------------------------------------------------
// EnumHelper
// ---------------------------------------------------------------------------

/// Checker for enumeration fields: only listed keys are valid.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumHelper<K> {
    keys: Vec<K>,
    entries: Vec<EnumEntry>,
}

impl<K> Default for EnumHelper<K> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            entries: Vec::new(),
        }
    }
}

impl<K: fmt::Display> EnumHelper<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Order of insertion is the display order.
    #[must_use]
    pub fn with_entry(mut self, key: K, name: impl Into<String>) -> Self {
        self.entries.push(EnumEntry::new(key.to_string(), name));
        self.keys.push(key);
        self
    }

    /// Add an entry with a description.
    #[must_use]
    pub fn with_described_entry(
        mut self,
        key: K,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.entries
            .push(EnumEntry::new(key.to_string(), name).with_description(description));
        self.keys.push(key);
        self
    }

    /// Entries in display order.
    #[must_use]
    pub fn entries(&self) -> &[EnumEntry] {
        &self.entries
    }
}

impl<K: Clone + PartialEq + fmt::Display> Helper<K> for EnumHelper<K> {
    fn limit(&self, value: &K) -> Option<K> {
        Some(value.clone())
    }

    fn check(&self, value: &K) -> Option<String> {
        if self.keys.contains(value) {
            None
        } else {
            Some(format!("{value} is not in list"))
        }
    }

    fn related(&self) -> Option<Related> {
        Some(Related::Enum {
            entries: self.entries.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_clamps_into_range() {
        let helper = NumberHelper::range(0.0, 10.0);
        assert_eq!(helper.limit(&12.0), Some(10.0));
        assert_eq!(helper.limit(&-3.0), Some(0.0));
        assert_eq!(helper.limit(&4.5), Some(4.5));
    }

    #[test]
    fn number_snaps_to_step() {
        let helper = NumberHelper::new().with_step(0.1);
        assert_eq!(helper.decimals(), Some(1));
        assert_eq!(helper.limit(&0.26), Some(0.3));
        assert_eq!(helper.limit(&0.24), Some(0.2));
    }

    #[test]
    fn number_snaps_with_start_offset() {
        let helper = NumberHelper::new().with_step(2.0).with_start(0.5);
        assert_eq!(helper.decimals(), Some(1));
        assert_eq!(helper.limit(&3.0), Some(2.5));
        assert_eq!(helper.limit(&5.0), Some(4.5));
    }

    #[test]
    fn explicit_decimals_win_over_step() {
        let helper = NumberHelper::new().with_decimals(3).with_step(0.5);
        assert_eq!(helper.decimals(), Some(3));
    }

    #[test]
    fn step_then_clamp() {
        let helper = NumberHelper::range(0.0, 1.0).with_step(0.25);
        assert_eq!(helper.limit(&0.9), Some(1.0));
        assert_eq!(helper.limit(&7.0), Some(1.0));
    }

    #[test]
    fn number_check_messages() {
        let helper = NumberHelper::range(1.0, 5.0);
        assert_eq!(
            helper.check(&7.0).as_deref(),
            Some("7 is bigger than the limit of 5")
        );
        assert_eq!(
            helper.check(&0.0).as_deref(),
            Some("0 is smaller than the limit of 1")
        );
        assert_eq!(helper.check(&3.0), None);
    }

    #[test]
    fn number_related_reports_configuration() {
        let helper = NumberHelper::range(0.0, 100.0).with_unit("%");
        match helper.related() {
            Some(Related::Number { min, max, unit, .. }) => {
                assert_eq!(min, Some(0.0));
                assert_eq!(max, Some(100.0));
                assert_eq!(unit.as_deref(), Some("%"));
            }
            other => panic!("unexpected related {other:?}"),
        }
    }

    #[test]
    fn text_truncates_by_chars_then_bytes() {
        let helper = TextHelper::new().with_max_length(3);
        assert_eq!(helper.limit(&"abcdef".into()).as_deref(), Some("abc"));

        // "é" is two bytes; a cut in the middle drops the whole char.
        let helper = TextHelper::new().with_max_bytes(3);
        assert_eq!(helper.limit(&"aéé".into()).as_deref(), Some("aé"));
        let helper = TextHelper::new().with_max_bytes(2);
        assert_eq!(helper.limit(&"aéé".into()).as_deref(), Some("a"));
    }

    #[test]
    fn text_check_messages() {
        let helper = TextHelper::new().with_max_length(2).with_max_bytes(10);
        assert_eq!(
            helper.check(&"abc".into()).as_deref(),
            Some("the text is longer than the limit of 2 characters")
        );
        let helper = TextHelper::new().with_max_bytes(1);
        assert_eq!(
            helper.check(&"é".into()).as_deref(),
            Some("the text is longer than the limit of 1 bytes")
        );
        assert_eq!(helper.check(&"".into()), None);
    }

    #[test]
    fn enum_checks_membership() {
        let helper = EnumHelper::new()
            .with_entry("auto", "Automatic")
            .with_described_entry("manual", "Manual", "Operator controlled");
        assert_eq!(helper.check(&"auto"), None);
        assert_eq!(
            helper.check(&"off").as_deref(),
            Some("off is not in list")
        );
        assert_eq!(helper.limit(&"off"), Some("off"));
        match helper.related() {
            Some(Related::Enum { entries }) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].description.as_deref(), Some("Operator controlled"));
            }
            other => panic!("unexpected related {other:?}"),
        }
    }

    #[test]
    fn custom_related_compares_by_pointer() {
        let payload: Rc<dyn Any> = Rc::new(5_u8);
        let a = Related::Custom(Rc::clone(&payload));
        let b = Related::Custom(payload);
        let c = Related::Custom(Rc::new(5_u8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
