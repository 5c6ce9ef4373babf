//! Host-visible parameters.
//!
//! A [`Parameter`] stores its current value as an `f32` bit-cast into an
//! `AtomicU32`, so the processing thread reads it lock-free while the host
//! integration layer writes it from whichever thread delivers automation.
//!
//! Three kinds share that storage:
//!
//! | Kind     | Stored value            | Serialized as        |
//! |----------|-------------------------|----------------------|
//! | `Float`  | plain value in `[min, max]` | JSON number      |
//! | `Bool`   | `0.0` or `1.0`          | JSON bool            |
//! | `Choice` | option index            | JSON integer index   |

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;

use crate::state_value::Applied;

/// What kind of value a parameter holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    /// Continuous value clamped to `[min, max]`.
    Float {
        /// Minimum allowed value.
        min: f32,
        /// Maximum allowed value.
        max: f32,
    },
    /// On/off switch.
    Bool,
    /// One of a fixed list of labelled options.
    Choice {
        /// Option labels, indexed by stored value.
        options: Vec<String>,
    },
}

/// A host-automatable parameter.
///
/// Identity (`id`) is the stable key used for listener registration and for
/// serialization. It must never change once released.
#[derive(Debug)]
pub struct Parameter {
    id: String,
    name: String,
    kind: ParamKind,
    default: f32,
    value: AtomicU32,
}

impl Parameter {
    /// Continuous parameter.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sonido_state::Parameter;
    ///
    /// let gain = Parameter::float("gain", "Gain", -60.0, 12.0, 0.0);
    /// gain.set(-6.0);
    /// assert_eq!(gain.get(), -6.0);
    /// gain.set(100.0);
    /// assert_eq!(gain.get(), 12.0);
    /// ```
    pub fn float(
        id: impl Into<String>,
        name: impl Into<String>,
        min: f32,
        max: f32,
        default: f32,
    ) -> Self {
        // Non-finite inputs would poison clamping; fall back to the default.
        let default = if default.is_finite() { default } else { 0.0 };
        let min = if min.is_finite() { min } else { default };
        let max = if max.is_finite() { max } else { default };
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self::with_kind(id, name, ParamKind::Float { min, max }, default.clamp(min, max))
    }

    /// On/off parameter.
    pub fn boolean(id: impl Into<String>, name: impl Into<String>, default: bool) -> Self {
        Self::with_kind(id, name, ParamKind::Bool, bool_to_f32(default))
    }

    /// Parameter selecting one of `options`.
    pub fn choice<I, S>(
        id: impl Into<String>,
        name: impl Into<String>,
        options: I,
        default_index: usize,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        let last = options.len().saturating_sub(1);
        let default = default_index.min(last) as f32;
        Self::with_kind(id, name, ParamKind::Choice { options }, default)
    }

    fn with_kind(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ParamKind,
        default: f32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            default,
            value: AtomicU32::new(default.to_bits()),
        }
    }

    /// Stable identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value kind and range.
    pub fn kind(&self) -> &ParamKind {
        &self.kind
    }

    /// Default value (plain units; `0.0`/`1.0` for bools, index for choices).
    pub fn default_value(&self) -> f32 {
        self.default
    }

    /// Current value (lock-free).
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }

    /// Current value as a bool (`>= 0.5`).
    #[inline]
    pub fn get_bool(&self) -> bool {
        self.get() >= 0.5
    }

    /// Current value as a choice index.
    #[inline]
    pub fn get_index(&self) -> usize {
        self.get().max(0.0).round() as usize
    }

    /// Label of the selected option, for choice parameters.
    pub fn selected_option(&self) -> Option<&str> {
        match &self.kind {
            ParamKind::Choice { options } => options.get(self.get_index()).map(String::as_str),
            _ => None,
        }
    }

    /// Write a value (lock-free). Clamped and quantized to the parameter kind;
    /// non-finite values are ignored.
    #[inline]
    pub fn set(&self, value: f32) {
        if let Some(v) = self.constrain(value) {
            self.value.store(v.to_bits(), Ordering::Release);
        }
    }

    /// Write a bool value.
    pub fn set_bool(&self, value: bool) {
        self.set(bool_to_f32(value));
    }

    /// Restore the default value.
    pub fn reset(&self) {
        self.set(self.default);
    }

    /// Current value mapped linearly to `[0.0, 1.0]`.
    pub fn normalized(&self) -> f32 {
        let (min, max) = self.bounds();
        let range = max - min;
        if range == 0.0 {
            return 0.0;
        }
        (self.get() - min) / range
    }

    /// Write a value given in `[0.0, 1.0]`.
    pub fn set_normalized(&self, normalized: f32) {
        let (min, max) = self.bounds();
        self.set(min + normalized.clamp(0.0, 1.0) * (max - min));
    }

    /// Human-readable current value.
    pub fn display_value(&self) -> String {
        match &self.kind {
            ParamKind::Float { .. } => format!("{:.2}", self.get()),
            ParamKind::Bool => if self.get_bool() { "On" } else { "Off" }.to_string(),
            ParamKind::Choice { .. } => self.selected_option().unwrap_or("").to_string(),
        }
    }

    fn bounds(&self) -> (f32, f32) {
        match &self.kind {
            ParamKind::Float { min, max } => (*min, *max),
            ParamKind::Bool => (0.0, 1.0),
            ParamKind::Choice { options } => (0.0, options.len().saturating_sub(1) as f32),
        }
    }

    fn constrain(&self, value: f32) -> Option<f32> {
        if !value.is_finite() {
            return None;
        }
        let (min, max) = self.bounds();
        Some(match self.kind {
            ParamKind::Float { .. } => value.clamp(min, max),
            ParamKind::Bool => bool_to_f32(value >= 0.5),
            ParamKind::Choice { .. } => value.round().clamp(min, max),
        })
    }

    /// Raw stored bits, compared by the per-block change detector.
    #[inline]
    pub(crate) fn raw_bits(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Serialized form of the current value.
    pub(crate) fn to_json(&self) -> Value {
        match self.kind {
            ParamKind::Float { .. } => Value::from(f64::from(self.get())),
            ParamKind::Bool => Value::Bool(self.get_bool()),
            ParamKind::Choice { .. } => Value::from(self.get_index() as u64),
        }
    }

    /// Convert a serialized entry to a stored value, or `None` if the entry
    /// cannot describe this parameter.
    fn value_from_json(&self, value: &Value) -> Option<f32> {
        match &self.kind {
            ParamKind::Float { .. } => value.as_f64().map(|v| v as f32),
            // Older saves stored every parameter as a number.
            ParamKind::Bool => value
                .as_bool()
                .map(bool_to_f32)
                .or_else(|| value.as_f64().map(|v| bool_to_f32(v >= 0.5))),
            ParamKind::Choice { options } => {
                let index = match value {
                    Value::String(label) => options.iter().position(|o| o == label)?,
                    _ => {
                        let n = value.as_f64()?;
                        if n < 0.0 || n.fract() != 0.0 {
                            return None;
                        }
                        n as usize
                    }
                };
                (index < options.len()).then_some(index as f32)
            }
        }
    }

    /// Apply a serialized entry.
    pub(crate) fn apply_json(&self, value: &Value) -> Applied {
        let Some(v) = self.value_from_json(value).and_then(|v| self.constrain(v)) else {
            return Applied::Rejected;
        };
        let previous = self.value.swap(v.to_bits(), Ordering::AcqRel);
        if previous == v.to_bits() {
            Applied::Unchanged
        } else {
            Applied::Changed
        }
    }
}

#[inline]
fn bool_to_f32(value: bool) -> f32 {
    if value { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn float_clamps() {
        let p = Parameter::float("gain", "Gain", -60.0, 12.0, 0.0);
        p.set(-100.0);
        assert_eq!(p.get(), -60.0);
        p.set(100.0);
        assert_eq!(p.get(), 12.0);
    }

    #[test]
    fn float_default_is_clamped() {
        let p = Parameter::float("x", "X", 0.0, 1.0, 5.0);
        assert_eq!(p.default_value(), 1.0);
        assert_eq!(p.get(), 1.0);
    }

    #[test]
    fn non_finite_bounds_fall_back_to_default() {
        let p = Parameter::float("x", "X", f32::NAN, 1.0, 0.5);
        assert_eq!(p.kind(), &ParamKind::Float { min: 0.5, max: 1.0 });
        p.set(0.0);
        assert_eq!(p.get(), 0.5);

        let p = Parameter::float("y", "Y", -1.0, f32::INFINITY, f32::NAN);
        assert_eq!(p.default_value(), 0.0);
        assert_eq!(p.kind(), &ParamKind::Float { min: -1.0, max: 0.0 });

        let p = Parameter::float("z", "Z", f32::NAN, f32::NAN, 2.0);
        assert_eq!(p.get(), 2.0);
        assert_eq!(p.normalized(), 0.0);
    }

    #[test]
    fn non_finite_ignored() {
        let p = Parameter::float("x", "X", 0.0, 1.0, 0.5);
        p.set(f32::NAN);
        p.set(f32::INFINITY);
        assert_eq!(p.get(), 0.5);
    }

    #[test]
    fn bool_quantizes() {
        let p = Parameter::boolean("bypass", "Bypass", false);
        p.set(0.7);
        assert!(p.get_bool());
        assert_eq!(p.get(), 1.0);
        p.set_bool(false);
        assert_eq!(p.get(), 0.0);
    }

    #[test]
    fn choice_rounds_and_clamps() {
        let p = Parameter::choice("mode", "Mode", ["Clean", "Crunch", "Lead"], 0);
        p.set(1.4);
        assert_eq!(p.get_index(), 1);
        assert_eq!(p.selected_option(), Some("Crunch"));
        p.set(9.0);
        assert_eq!(p.get_index(), 2);
    }

    #[test]
    fn normalized_roundtrip() {
        let p = Parameter::float("mix", "Mix", 0.0, 100.0, 50.0);
        assert_eq!(p.normalized(), 0.5);
        p.set_normalized(0.25);
        assert_eq!(p.get(), 25.0);
    }

    #[test]
    fn reset_restores_default() {
        let p = Parameter::float("mix", "Mix", 0.0, 100.0, 50.0);
        p.set(10.0);
        p.reset();
        assert_eq!(p.get(), 50.0);
    }

    #[test]
    fn json_apply_reports_change() {
        let p = Parameter::float("gain", "Gain", -60.0, 12.0, 0.0);
        assert_eq!(p.apply_json(&json!(-3.0)), Applied::Changed);
        assert_eq!(p.apply_json(&json!(-3.0)), Applied::Unchanged);
        assert_eq!(p.apply_json(&json!("loud")), Applied::Rejected);
        assert_eq!(p.get(), -3.0);
    }

    #[test]
    fn json_apply_clamps_out_of_range() {
        let p = Parameter::float("gain", "Gain", -60.0, 12.0, 0.0);
        assert_eq!(p.apply_json(&json!(999_999.0)), Applied::Changed);
        assert_eq!(p.get(), 12.0);
    }

    #[test]
    fn choice_json_accepts_index_or_label() {
        let p = Parameter::choice("mode", "Mode", ["A", "B", "C"], 0);
        assert_eq!(p.apply_json(&json!(2)), Applied::Changed);
        assert_eq!(p.get_index(), 2);
        assert_eq!(p.apply_json(&json!("B")), Applied::Changed);
        assert_eq!(p.get_index(), 1);
        assert_eq!(p.apply_json(&json!(7)), Applied::Rejected);
        assert_eq!(p.apply_json(&json!("Z")), Applied::Rejected);
        assert_eq!(p.apply_json(&json!(1.5)), Applied::Rejected);
        assert_eq!(p.apply_json(&json!(-1)), Applied::Rejected);
        assert_eq!(p.to_json(), json!(1));
        assert_eq!(p.apply_json(&json!(0.0)), Applied::Changed);
        assert_eq!(p.get_index(), 0);
    }

    #[test]
    fn bool_json_accepts_legacy_numbers() {
        let p = Parameter::boolean("bypass", "Bypass", false);
        assert_eq!(p.apply_json(&json!(1.0)), Applied::Changed);
        assert!(p.get_bool());
        assert_eq!(p.to_json(), json!(true));
    }

    #[test]
    fn display_value_per_kind() {
        assert_eq!(
            Parameter::float("g", "G", -1.0, 1.0, 0.5).display_value(),
            "0.50"
        );
        assert_eq!(Parameter::boolean("b", "B", true).display_value(), "On");
        assert_eq!(
            Parameter::choice("c", "C", ["Lo", "Hi"], 1).display_value(),
            "Hi"
        );
    }
}
