// Gateway signing. Both directions use HMAC-SHA256 over a canonical
// parameter string, hex encoded: the pay redirect we hand the buyer, and the
// callback the gateway sends us. Verification compares in constant time and
// bounds timestamp skew.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp outside accepted skew")]
    SkewExceeded,
}

/// Query parameters the gateway echoes back on payment notification.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub order_id: String,
    pub trade_ref: String,
    pub amount: String,
    pub ts: i64,
    pub sign: String,
}

fn hmac_hex(secret: &str, canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn sign_pay_request(secret: &str, order_id: &str, amount: &str, ts: i64) -> String {
    hmac_hex(secret, &format!("amount:{amount}\norder_id:{order_id}\nts:{ts}"))
}

/// The redirect target for a fresh order. Every parameter is URL-safe by
/// construction (generated id, fixed-scale amount, epoch seconds, hex sig),
/// so no encoding layer is needed.
pub fn build_pay_url(base: &str, secret: &str, order_id: &str, amount: &str, ts: i64) -> String {
    let sign = sign_pay_request(secret, order_id, amount, ts);
    format!("{base}?order_id={order_id}&amount={amount}&ts={ts}&sign={sign}")
}

pub fn sign_callback(secret: &str, order_id: &str, trade_ref: &str, amount: &str, ts: i64) -> String {
    hmac_hex(
        secret,
        &format!("amount:{amount}\norder_id:{order_id}\nts:{ts}\ntrade_ref:{trade_ref}"),
    )
}

pub fn verify_callback(
    secret: &str,
    params: &CallbackParams,
    now: i64,
    max_skew_secs: i64,
) -> Result<(), SignatureError> {
    if (now - params.ts).abs() > max_skew_secs {
        return Err(SignatureError::SkewExceeded);
    }
    let expected = sign_callback(secret, &params.order_id, &params.trade_ref, &params.amount, params.ts);
    let provided = params.sign.strip_prefix("sha256=").unwrap_or(params.sign.as_str());
    let eq = ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).unwrap_u8();
    if eq != 1 {
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "shop-test-secret";

    fn params(sign: String) -> CallbackParams {
        CallbackParams {
            order_id: "ord_1".into(),
            trade_ref: "t_9".into(),
            amount: "10.00".into(),
            ts: 1_700_000_000,
            sign,
        }
    }

    #[test]
    fn callback_round_trip() {
        let sig = sign_callback(SECRET, "ord_1", "t_9", "10.00", 1_700_000_000);
        assert!(verify_callback(SECRET, &params(sig), 1_700_000_010, 300).is_ok());
    }

    #[test]
    fn accepts_prefixed_signature() {
        let sig = sign_callback(SECRET, "ord_1", "t_9", "10.00", 1_700_000_000);
        assert!(verify_callback(SECRET, &params(format!("sha256={sig}")), 1_700_000_000, 300).is_ok());
    }

    #[test]
    fn rejects_tampered_amount() {
        let sig = sign_callback(SECRET, "ord_1", "t_9", "10.00", 1_700_000_000);
        let mut p = params(sig);
        p.amount = "99.00".into();
        assert_eq!(verify_callback(SECRET, &p, 1_700_000_000, 300), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_wrong_secret() {
        let sig = sign_callback("other-secret", "ord_1", "t_9", "10.00", 1_700_000_000);
        assert_eq!(verify_callback(SECRET, &params(sig), 1_700_000_000, 300), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let sig = sign_callback(SECRET, "ord_1", "t_9", "10.00", 1_700_000_000);
        assert_eq!(verify_callback(SECRET, &params(sig), 1_700_000_301, 300), Err(SignatureError::SkewExceeded));
    }

    #[test]
    fn pay_url_carries_verifiable_signature() {
        let url = build_pay_url("https://pay.example.com/submit", SECRET, "ord_1", "10.00", 1_700_000_000);
        assert!(url.starts_with("https://pay.example.com/submit?order_id=ord_1&amount=10.00&ts=1700000000&sign="));
        let sign = url.rsplit("sign=").next().unwrap();
        assert_eq!(sign, sign_pay_request(SECRET, "ord_1", "10.00", 1_700_000_000));
    }
}
