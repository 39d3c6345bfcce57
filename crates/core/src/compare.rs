//! Structural equality between expected and actual test outputs.
//!
//! JSON values returned by the sandbox are compared by shape. Numbers are
//! compared by value so that an integer `4` and a float `4.0` are equal, while
//! floats only tolerate drift when the test case explicitly carries a
//! tolerance. Integers too wide for 64 bits compare by their exact digits.

use serde_json::{Number, Value};

/// Compare `actual` against `expected`, optionally with a float tolerance.
pub fn outputs_match(expected: &Value, actual: &Value, tolerance: Option<f64>) -> bool {
    match (expected, actual) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(e), Value::Bool(a)) => e == a,
        (Value::String(e), Value::String(a)) => e == a,
        (Value::Number(e), Value::Number(a)) => numbers_match(e, a, tolerance),
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len()
                && e.iter()
                    .zip(a.iter())
                    .all(|(ev, av)| outputs_match(ev, av, tolerance))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e.iter().all(|(key, ev)| {
                    a.get(key)
                        .is_some_and(|av| outputs_match(ev, av, tolerance))
                })
        }
        _ => false,
    }
}

fn numbers_match(expected: &Number, actual: &Number, tolerance: Option<f64>) -> bool {
    // Integers that fit in i64/u64 compare exactly.
    if let (Some(e), Some(a)) = (expected.as_i64(), actual.as_i64()) {
        return e == a;
    }
    if let (Some(e), Some(a)) = (expected.as_u64(), actual.as_u64()) {
        return e == a;
    }
    if let (Some(e), Some(a)) = (integer_digits(expected), integer_digits(actual)) {
        return e == a;
    }

    let (Some(e), Some(a)) = (expected.as_f64(), actual.as_f64()) else {
        return false;
    };

    if e == a {
        return true;
    }

    match tolerance {
        Some(tol) => {
            let diff = (e - a).abs();
            diff <= tol || (e != 0.0 && diff / e.abs() <= tol)
        }
        None => false,
    }
}

/// Source text of an integer literal, `None` for floats.
fn integer_digits(n: &Number) -> Option<String> {
    let text = n.to_string();
    let digits = text.strip_prefix('-').unwrap_or(&text);
    let integral = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
    integral.then_some(text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
