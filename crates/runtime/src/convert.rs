//! Guest string conversion
//!
//! The `to_string` rules of the language surface:
//! - numbers: integral values print with no decimal point, everything
//!   else with six significant digits (`%.6g` style)
//! - objects: `<Name instance>` when the object carries a `__name__`
//!   string (or the instance's struct type), otherwise `<object>`
//! - functions print their name, natives are opaque
//!
//! Integral numbers round-trip exactly through `number_to_string`; the
//! six-digit path is a display format, not a serialization format.

use swiftlang_core::Value;

use crate::vm::Vm;

/// Largest magnitude treated as "integral" for formatting. Beyond 2^53
/// doubles cannot represent every integer, so they take the general path.
const INTEGRAL_MAX: f64 = 9_007_199_254_740_992.0;

/// Format a number the way the guest sees it.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.trunc() && n.abs() < INTEGRAL_MAX {
        return format!("{}", n as i64);
    }
    format_g6(n)
}

/// `%.6g`: six significant digits, scientific notation outside
/// [1e-4, 1e6), trailing zeros trimmed.
fn format_g6(n: f64) -> String {
    let exp = n.abs().log10().floor() as i32;
    if !(-4..6).contains(&exp) {
        let s = format!("{:.5e}", n);
        trim_mantissa(&s)
    } else {
        let decimals = (5 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, n);
        trim_fraction(&s)
    }
}

fn trim_fraction(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

fn trim_mantissa(s: &str) -> String {
    // "1.500000e8" -> "1.5e8"
    match s.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{}", trim_fraction(mantissa), exp),
        None => s.to_string(),
    }
}

impl Vm {
    /// Convert any value to its guest string form.
    pub fn to_display_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Str(id) => self.strings.resolve(id).to_string(),
            Value::Object(handle) => {
                let name = self
                    .heap
                    .object(handle)
                    .and_then(|o| o.get_own_property(self.known.name))
                    .and_then(|v| v.as_str());
                match name {
                    Some(id) => format!("<{} instance>", self.strings.resolve(id)),
                    None => "<object>".to_string(),
                }
            }
            Value::Struct(handle) => match self.heap.struct_instance(handle) {
                Some(instance) => {
                    format!("<{} instance>", self.strings.resolve(instance.type_name))
                }
                None => "<object>".to_string(),
            },
            Value::Function(handle) => match self.heap.function(handle) {
                Some(f) => format!("<fn {}>", self.strings.resolve(f.name)),
                None => "<fn>".to_string(),
            },
            Value::Closure(handle) => {
                let name = self
                    .heap
                    .closure(handle)
                    .and_then(|c| self.heap.function(c.function))
                    .map(|f| self.strings.resolve(f.name).to_string());
                match name {
                    Some(name) => format!("<fn {}>", name),
                    None => "<fn>".to_string(),
                }
            }
            Value::Native(_) => "<native fn>".to_string(),
        }
    }
}
