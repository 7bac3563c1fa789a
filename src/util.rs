use alloc::string::String;

use base64::engine::Engine as Base64Engine;

pub fn base64_encode(content: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(content)
}

/// Float remainder whose sign follows the divisor.
pub fn modulus(a: f64, b: f64) -> f64 {
    let r = libm::fmod(a, b);
    if r != 0.0 && r.is_sign_negative() != b.is_sign_negative() { r + b } else { r }
}

#[test]
fn test_modulus() {
    assert_eq!(modulus(7.0, 3.0), 1.0);
    assert_eq!(modulus(-7.0, 3.0), 2.0);
    assert_eq!(modulus(7.0, -3.0), -2.0);
    assert_eq!(modulus(-6.0, 3.0), 0.0);
    assert_eq!(modulus(5.5, 2.0), 1.5);
}

#[test]
fn test_base64() {
    assert_eq!(base64_encode(&[100, 0, 83, 0]), "ZABTAA==");
    assert_eq!(base64_encode(&[]), "");
}
