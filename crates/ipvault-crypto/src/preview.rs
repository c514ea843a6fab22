//! Preview downsampling.
//!
//! A preview of a text document keeps its wording but shifts every number
//! by more than 5% and at most 10%, so the preview can be shared under a
//! looser policy without disclosing the exact figures.

use rand::Rng;

/// Relative shift bounds applied to each number.
const MIN_SHIFT: f64 = 0.05;
const MAX_SHIFT: f64 = 0.10;

/// Perturb every decimal number in `text`, keeping its count of decimals.
pub fn downsample<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            let ch = text[i..].chars().next().unwrap_or_default();
            out.push(ch);
            i += ch.len_utf8().max(1);
            continue;
        }

        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let mut decimals = 0;
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            i += 1;
            let fraction = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            decimals = i - fraction;
        }
        out.push_str(&perturb(&text[start..i], decimals, rng));
    }
    out
}

fn perturb<R: Rng + ?Sized>(token: &str, decimals: usize, rng: &mut R) -> String {
    let Ok(value) = token.parse::<f64>() else {
        return token.to_string();
    };
    // strictly above MIN_SHIFT
    let magnitude = MIN_SHIFT + rng.gen_range(f64::EPSILON..=(MAX_SHIFT - MIN_SHIFT));
    let factor = if rng.gen_bool(0.5) {
        1.0 + magnitude
    } else {
        1.0 - magnitude
    };
    format!("{:.*}", decimals, value * factor)
}
