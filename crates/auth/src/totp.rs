use crate::AuthError;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use std::fmt::Write as _;
use std::str::FromStr;
use subtle::ConstantTimeEq;

pub const TOTP_DIGITS: u32 = 6;
pub const TOTP_PERIOD_SECONDS: u64 = 30;
const SECRET_LENGTH: usize = 32;
const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpAlgorithm {
    Sha1,
    Sha256,
}

impl TotpAlgorithm {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

impl FromStr for TotpAlgorithm {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            _ => Err(AuthError::InvalidTotpUrl),
        }
    }
}

/// Time-based one-time password parameters for one account, serializable to
/// and from an otpauth:// URL stored on the user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Totp {
    pub issuer: String,
    pub account: String,
    secret: Vec<u8>,
    pub algorithm: TotpAlgorithm,
    pub digits: u32,
    pub period: u64,
}

/// Generates a random secret in base-32 representation.
pub fn generate_base32_secret(length: usize) -> String {
    let mut seed = vec![0u8; length];
    OsRng.fill_bytes(&mut seed);
    seed.iter()
        .map(|byte| BASE32_ALPHABET[(*byte as usize) % BASE32_ALPHABET.len()] as char)
        .collect()
}

impl Totp {
    /// Creates fresh TOTP parameters with a random secret, 6 digits and a
    /// 30-second step.
    pub fn generate(issuer: &str, account: &str) -> Result<Self, AuthError> {
        let encoded = generate_base32_secret(SECRET_LENGTH);
        Ok(Self {
            issuer: issuer.to_string(),
            account: account.to_string(),
            secret: base32_decode(&encoded)?,
            algorithm: TotpAlgorithm::Sha256,
            digits: TOTP_DIGITS,
            period: TOTP_PERIOD_SECONDS,
        })
    }

    /// Parses an otpauth://totp/ URL.
    pub fn from_url(url: &str) -> Result<Self, AuthError> {
        let rest = url
            .strip_prefix("otpauth://totp/")
            .ok_or(AuthError::InvalidTotpUrl)?;
        let (label, query) = rest.split_once('?').ok_or(AuthError::InvalidTotpUrl)?;
        let label = percent_decode(label)?;
        let (label_issuer, account) = match label.split_once(':') {
            Some((issuer, account)) => (Some(issuer.to_string()), account.to_string()),
            None => (None, label),
        };
        let mut secret = None;
        let mut issuer = label_issuer;
        let mut algorithm = TotpAlgorithm::Sha1;
        let mut digits = TOTP_DIGITS;
        let mut period = TOTP_PERIOD_SECONDS;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').ok_or(AuthError::InvalidTotpUrl)?;
            match key {
                "secret" => secret = Some(base32_decode(value)?),
                "issuer" => issuer = Some(percent_decode(value)?),
                "algorithm" => algorithm = TotpAlgorithm::from_str(value)?,
                "digits" => {
                    digits = value.parse().map_err(|_| AuthError::InvalidTotpUrl)?;
                }
                "period" => {
                    period = value.parse().map_err(|_| AuthError::InvalidTotpUrl)?;
                }
                _ => {}
            }
        }
        if digits == 0 || digits > 10 || period == 0 {
            return Err(AuthError::InvalidTotpUrl);
        }
        Ok(Self {
            issuer: issuer.unwrap_or_default(),
            account,
            secret: secret.ok_or(AuthError::InvalidTotpUrl)?,
            algorithm,
            digits,
            period,
        })
    }

    /// Renders the otpauth://totp/ URL for this account.
    pub fn to_url(&self) -> String {
        format!(
            "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm={}&digits={}&period={}",
            percent_encode(&self.issuer),
            percent_encode(&self.account),
            base32_encode(&self.secret),
            percent_encode(&self.issuer),
            self.algorithm.as_str(),
            self.digits,
            self.period
        )
    }

    /// Validates a code against the current time step and its immediate
    /// neighbors, returning the matched drift (0 = exact step). `None` means
    /// the code is not valid anywhere in the tolerance window.
    pub fn validate(&self, code: &str, now_unix: u64) -> Option<i64> {
        if code.len() != self.digits as usize {
            return None;
        }
        let counter = (now_unix / self.period) as i64;
        for drift in [0i64, -1, 1] {
            let candidate = counter + drift;
            if candidate < 0 {
                continue;
            }
            let Ok(expected) = self.code_at(candidate as u64) else {
                return None;
            };
            if expected.as_bytes().ct_eq(code.as_bytes()).into() {
                return Some(drift);
            }
        }
        None
    }

    /// Computes the code for one counter value (RFC 4226 dynamic truncation).
    pub fn code_at(&self, counter: u64) -> Result<String, AuthError> {
        let message = counter.to_be_bytes();
        let digest = match self.algorithm {
            TotpAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.secret)
                    .map_err(|_| AuthError::InvalidKey)?;
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
                    .map_err(|_| AuthError::InvalidKey)?;
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
        };
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | digest[offset + 3] as u32;
        let code = binary % 10u32.pow(self.digits);
        Ok(format!("{:0width$}", code, width = self.digits as usize))
    }
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    for byte in bytes {
        bits = (bits << 8) | *byte as u32;
        bit_count += 8;
        while bit_count >= 5 {
            let index = (bits >> (bit_count - 5)) & 0x1f;
            output.push(BASE32_ALPHABET[index as usize] as char);
            bit_count -= 5;
        }
    }
    if bit_count > 0 {
        let index = (bits << (5 - bit_count)) & 0x1f;
        output.push(BASE32_ALPHABET[index as usize] as char);
    }
    output
}

fn base32_decode(input: &str) -> Result<Vec<u8>, AuthError> {
    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    for symbol in input.trim_end_matches('=').bytes() {
        let value = match symbol {
            b'A'..=b'Z' => symbol - b'A',
            b'a'..=b'z' => symbol - b'a',
            b'2'..=b'7' => symbol - b'2' + 26,
            _ => return Err(AuthError::InvalidTotpUrl),
        };
        bits = (bits << 5) | value as u32;
        bit_count += 5;
        if bit_count >= 8 {
            output.push((bits >> (bit_count - 8)) as u8);
            bit_count -= 8;
        }
    }
    Ok(output)
}

fn percent_encode(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                output.push(byte as char);
            }
            _ => {
                let _ = write!(output, "%{:02X}", byte);
            }
        }
    }
    output
}

fn percent_decode(input: &str) -> Result<String, AuthError> {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = input
                .get(index + 1..index + 3)
                .ok_or(AuthError::InvalidTotpUrl)?;
            let value = u8::from_str_radix(hex, 16).map_err(|_| AuthError::InvalidTotpUrl)?;
            output.push(value);
            index += 3;
        } else {
            output.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(output).map_err(|_| AuthError::InvalidTotpUrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_totp(algorithm: TotpAlgorithm, secret: &[u8]) -> Totp {
        Totp {
            issuer: "Sotto".to_string(),
            account: "alice".to_string(),
            secret: secret.to_vec(),
            algorithm,
            digits: TOTP_DIGITS,
            period: TOTP_PERIOD_SECONDS,
        }
    }

    #[test]
    fn sha1_reference_vector() {
        // RFC 6238 appendix B, T = 59 (counter 1), truncated to six digits.
        let totp = reference_totp(TotpAlgorithm::Sha1, b"12345678901234567890");
        assert_eq!(totp.code_at(1).unwrap(), "287082");
    }

    #[test]
    fn sha256_reference_vector() {
        let totp = reference_totp(
            TotpAlgorithm::Sha256,
            b"12345678901234567890123456789012",
        );
        assert_eq!(totp.code_at(1).unwrap(), "119246");
    }

    #[test]
    fn validates_with_drift_window() {
        let totp = reference_totp(TotpAlgorithm::Sha256, b"12345678901234567890123456789012");
        let now = 90u64; // counter 3
        assert_eq!(totp.validate(&totp.code_at(3).unwrap(), now), Some(0));
        assert_eq!(totp.validate(&totp.code_at(2).unwrap(), now), Some(-1));
        assert_eq!(totp.validate(&totp.code_at(4).unwrap(), now), Some(1));
        assert_eq!(totp.validate(&totp.code_at(7).unwrap(), now), None);
        assert_eq!(totp.validate("000", now), None);
        assert_eq!(totp.validate("notdigit", now), None);
    }

    #[test]
    fn url_roundtrip() {
        let totp = Totp::generate("Sotto Server", "alice").unwrap();
        let url = totp.to_url();
        assert!(url.starts_with("otpauth://totp/Sotto%20Server:alice?secret="));
        let parsed = Totp::from_url(&url).unwrap();
        assert_eq!(parsed, totp);
    }

    #[test]
    fn parses_minimal_url_with_defaults() {
        let parsed = Totp::from_url("otpauth://totp/alice?secret=MZXW6YTBOI").unwrap();
        assert_eq!(parsed.account, "alice");
        assert_eq!(parsed.issuer, "");
        assert_eq!(parsed.algorithm, TotpAlgorithm::Sha1);
        assert_eq!(parsed.digits, TOTP_DIGITS);
        assert_eq!(parsed.period, TOTP_PERIOD_SECONDS);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(Totp::from_url("https://example.org").is_err());
        assert!(Totp::from_url("otpauth://totp/alice").is_err());
        assert!(Totp::from_url("otpauth://totp/alice?issuer=x").is_err());
        assert!(Totp::from_url("otpauth://totp/alice?secret=01!").is_err());
        assert!(Totp::from_url("otpauth://totp/alice?secret=MZXW6YTBOI&digits=0").is_err());
    }

    #[test]
    fn base32_known_answer() {
        assert_eq!(base32_decode("MZXW6YTBOI").unwrap(), b"foobar");
        assert_eq!(base32_encode(b"foobar"), "MZXW6YTBOI");
        assert_eq!(base32_decode("MZXW6YTBOI======").unwrap(), b"foobar");
    }

    #[test]
    fn generated_secret_shape() {
        let secret = generate_base32_secret(SECRET_LENGTH);
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }
}
