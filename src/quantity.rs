//! Kubernetes memory quantity parsing and the memory-limit bump policy.

const KI: u64 = 1024;
const MI: u64 = 1024 * 1024;
const GI: u64 = 1024 * 1024 * 1024;

/// Floor for any bumped memory limit.
pub const MIN_LIMIT_BYTES: u64 = 256 * MI;
/// Ceiling no bump may exceed.
pub const MAX_LIMIT_BYTES: u64 = 4 * GI;

/// Parse a Kubernetes memory quantity (`128Mi`, `1Gi`, `500M`, plain bytes)
/// into bytes. CPU-style milli quantities are rejected.
pub fn parse_bytes(quantity: &str) -> Result<u64, String> {
    let s = quantity.trim();
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_part, unit) = s.split_at(split);
    let num: f64 = num_part
        .parse()
        .map_err(|_| format!("invalid quantity: {quantity}"))?;

    let scale = match unit {
        "" => 1,
        "Ki" => KI,
        "Mi" => MI,
        "Gi" => GI,
        "Ti" => KI.pow(4),
        "Pi" => KI.pow(5),
        "Ei" => KI.pow(6),
        "K" | "k" => 1000,
        "M" => 1000_u64.pow(2),
        "G" => 1000_u64.pow(3),
        "T" => 1000_u64.pow(4),
        "P" => 1000_u64.pow(5),
        "E" => 1000_u64.pow(6),
        other => return Err(format!("unsupported quantity unit: {other}")),
    };

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((num * scale as f64) as u64)
}

/// Render bytes as a quantity: whole `Gi` when exact, otherwise `Mi` rounded
/// up so patches never carry fractional quantities.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes > 0 && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else {
        format!("{}Mi", bytes.div_ceil(MI))
    }
}

/// Compute the bumped memory limit: `clamp(max(256Mi, current * 2), _, 4Gi)`.
/// An unknown current limit lands on the floor.
#[must_use]
pub fn bump_limit(current: Option<u64>) -> u64 {
    match current {
        None => MIN_LIMIT_BYTES,
        Some(cur) => cur
            .saturating_mul(2)
            .max(MIN_LIMIT_BYTES)
            .min(MAX_LIMIT_BYTES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_bytes("128Mi").unwrap(), 128 * MI);
        assert_eq!(parse_bytes("1Gi").unwrap(), GI);
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("500M").unwrap(), 500_000_000);
        assert_eq!(parse_bytes("1.5Gi").unwrap(), GI + GI / 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("abc").is_err());
        assert!(parse_bytes("100m").is_err()); // CPU milli, not memory
    }

    #[test]
    fn formats_whole_gi_and_ceils_mi() {
        assert_eq!(format_bytes(256 * MI), "256Mi");
        assert_eq!(format_bytes(GI), "1Gi");
        assert_eq!(format_bytes(4 * GI), "4Gi");
        assert_eq!(format_bytes(GI + 1), "1025Mi");
    }

    #[test]
    fn bump_doubles_with_floor_and_ceiling() {
        assert_eq!(bump_limit(Some(128 * MI)), 256 * MI);
        assert_eq!(bump_limit(Some(512 * MI)), GI);
        assert_eq!(bump_limit(Some(3 * GI)), 4 * GI);
        assert_eq!(bump_limit(None), 256 * MI);
        // Tiny limits still land on the floor.
        assert_eq!(bump_limit(Some(16 * MI)), 256 * MI);
    }

    #[test]
    fn bump_never_decreases_below_current_and_never_exceeds_max() {
        for cur in [64 * MI, 256 * MI, GI, 4 * GI] {
            let next = bump_limit(Some(cur));
            assert!(next >= cur);
            assert!(next <= MAX_LIMIT_BYTES);
        }
        // Already at the ceiling: unchanged (callers treat this as a no-op).
        assert_eq!(bump_limit(Some(4 * GI)), 4 * GI);
    }
}
