//! Numeric handling of Kubernetes resource quantities.
//!
//! The API server canonicalizes quantities ("0.5" comes back as "500m"), so
//! pod comparisons and request derivation work on parsed values.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity into base units (cores or bytes)
pub fn parse(quantity: &str) -> Option<f64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    // Plain number or exponent form ("1e3")
    q.parse::<f64>().ok()
}

/// Whether two quantities denote the same amount
pub fn equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse(&a.0), parse(&b.0)) {
        (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => a.0 == b.0,
    }
}

/// CPU quantity divided by `rate`, rendered in millicores
#[allow(clippy::cast_possible_truncation, reason = "millicores fit in i64")]
pub fn divide_cpu(limit: &Quantity, rate: f64) -> Option<Quantity> {
    let cores = parse(&limit.0)?;
    let millis = (cores * 1000.0 / rate).round() as i64;
    Some(Quantity(format!("{}m", millis.max(1))))
}

/// Memory quantity divided by `rate`, rendered in bytes
#[allow(clippy::cast_possible_truncation, reason = "byte counts fit in i64")]
pub fn divide_memory(limit: &Quantity, rate: f64) -> Option<Quantity> {
    let bytes = parse(&limit.0)?;
    let out = (bytes / rate).round() as i64;
    Some(Quantity(out.max(1).to_string()))
}
