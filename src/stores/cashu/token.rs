//! Token codec
//!
//! Serializes proof sets to portable token strings and back (NUT-00).
//! V4 (`cashuB`, CBOR) is produced; both V4 and the legacy V3 (`cashuA`,
//! JSON) are accepted. Any other `cashu` version letter is rejected as
//! unsupported rather than guessed at.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use super::types::{CurrencyUnit, Proof, Token};
use super::utils::normalize_mint_url;

/// URI scheme some wallets prepend to tokens
const URI_PREFIX: &str = "cashu:";

const PADDING_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);

/// Older V3 tokens were produced with the standard alphabet
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);

// =============================================================================
// Token Format Detection
// =============================================================================

/// Token format version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// V3 format (cashuA prefix, base64 JSON)
    V3,
    /// V4 format (cashuB prefix, compact CBOR)
    V4,
}

impl TokenFormat {
    /// Get the prefix for this format
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenFormat::V3 => "cashuA",
            TokenFormat::V4 => "cashuB",
        }
    }
}

/// Strip whitespace and an optional `cashu:` scheme
fn clean_token_str(token_str: &str) -> String {
    let compact: String = token_str.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.get(..URI_PREFIX.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(URI_PREFIX) => compact[URI_PREFIX.len()..].to_string(),
        _ => compact,
    }
}

/// Detect the token format, distinguishing unknown versions from garbage
pub fn detect_format(token_str: &str) -> CashuResult<TokenFormat> {
    let cleaned = clean_token_str(token_str);
    if cleaned.starts_with("cashuA") {
        Ok(TokenFormat::V3)
    } else if cleaned.starts_with("cashuB") {
        Ok(TokenFormat::V4)
    } else if let Some(version) = cleaned.strip_prefix("cashu").and_then(|rest| rest.chars().next()) {
        Err(CashuWalletError::UnsupportedVersion {
            version: version.to_string(),
        })
    } else {
        Err(malformed("missing cashu token prefix"))
    }
}

fn malformed(reason: impl Into<String>) -> CashuWalletError {
    CashuWalletError::MalformedToken {
        reason: reason.into(),
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode proofs as a V4 token string.
///
/// Proof order is preserved: consecutive proofs sharing a keyset id are
/// grouped, so a keyset id may appear in more than one group.
///
/// V4 carries keyset ids and signatures as raw bytes, which only decode back
/// to lowercase hex. Proofs with legacy base64 keyset ids or non-canonical
/// hex are encoded as V3 instead, so decoding returns them unchanged.
pub fn encode_token(proofs: &[Proof], mint_url: &str, unit: &CurrencyUnit, memo: Option<&str>) -> CashuResult<String> {
    if proofs.is_empty() {
        return Err(malformed("cannot encode a token without proofs"));
    }
    if mint_url.is_empty() {
        return Err(malformed("cannot encode a token without a mint url"));
    }
    if !proofs.iter().all(|p| is_canonical_hex(&p.id) && is_canonical_hex(&p.c)) {
        log::debug!("Proofs carry non-hex keyset ids or signatures; encoding as V3");
        return encode_token_v3(proofs, mint_url, unit, memo);
    }

    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    for proof in proofs {
        validate_proof(proof)?;
        let c = hex::decode(&proof.c).map_err(|_| malformed(format!("signature of {} is not hex", proof.secret_prefix())))?;
        let entry = Value::Map(vec![
            (text("a"), Value::Integer(proof.amount.into())),
            (text("s"), text(&proof.secret)),
            (text("c"), Value::Bytes(c)),
        ]);
        match groups.last_mut() {
            Some((id, entries)) if *id == proof.id => entries.push(entry),
            _ => groups.push((proof.id.clone(), vec![entry])),
        }
    }

    let mut token_groups = Vec::with_capacity(groups.len());
    for (id, entries) in groups {
        let id_bytes = hex::decode(&id).map_err(|_| malformed(format!("keyset id {} is not hex", id)))?;
        token_groups.push(Value::Map(vec![
            (text("i"), Value::Bytes(id_bytes)),
            (text("p"), Value::Array(entries)),
        ]));
    }

    let mut body = vec![(text("m"), text(mint_url)), (text("u"), text(unit.as_str()))];
    if let Some(memo) = memo {
        body.push((text("d"), text(memo)));
    }
    body.push((text("t"), Value::Array(token_groups)));

    let mut bytes = Vec::new();
    ciborium::into_writer(&Value::Map(body), &mut bytes)
        .map_err(|e| CashuWalletError::Internal(format!("CBOR encoding failed: {:?}", e)))?;

    Ok(format!("{}{}", TokenFormat::V4.prefix(), URL_SAFE_NO_PAD.encode(bytes)))
}

fn is_canonical_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn validate_proof(proof: &Proof) -> CashuResult<()> {
    if proof.amount == 0 {
        return Err(malformed("proof amount must be positive"));
    }
    if proof.secret.is_empty() {
        return Err(malformed("proof secret is empty"));
    }
    if proof.id.is_empty() || proof.c.is_empty() {
        return Err(malformed(format!("proof {} is missing keyset id or signature", proof.secret_prefix())));
    }
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a V3 or V4 token string.
///
/// Every proof is returned with `mint_url` set to the token's mint.
pub fn decode_token(token_str: &str) -> CashuResult<Token> {
    let format = detect_format(token_str)?;
    let cleaned = clean_token_str(token_str);
    let payload = &cleaned[format.prefix().len()..];

    let mut token = match format {
        TokenFormat::V4 => decode_v4(&decode_base64(payload)?)?,
        TokenFormat::V3 => decode_v3(&decode_base64(payload)?)?,
    };

    if token.proofs.is_empty() {
        return Err(malformed("token contains no proofs"));
    }
    for proof in &mut token.proofs {
        validate_proof(proof)?;
        proof.mint_url = token.mint_url.clone();
    }
    if token.value().is_none() {
        return Err(malformed("token value overflows"));
    }
    Ok(token)
}

fn decode_base64(payload: &str) -> CashuResult<Vec<u8>> {
    URL_SAFE_LENIENT
        .decode(payload)
        .or_else(|_| STANDARD_LENIENT.decode(payload))
        .map_err(|e| malformed(format!("invalid base64: {}", e)))
}

fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

fn decode_v4(bytes: &[u8]) -> CashuResult<Token> {
    let root: Value = ciborium::from_reader(bytes).map_err(|e| malformed(format!("invalid CBOR: {:?}", e)))?;
    let root = root.as_map().ok_or_else(|| malformed("token body is not a map"))?;

    let mint_url = map_get(root, "m")
        .and_then(Value::as_text)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| malformed("missing mint url"))?;
    let unit = map_get(root, "u")
        .and_then(Value::as_text)
        .ok_or_else(|| malformed("missing unit"))?;
    let memo = match map_get(root, "d") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_text().ok_or_else(|| malformed("memo is not text"))?.to_string()),
    };
    let groups = map_get(root, "t")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing proof groups"))?;

    let mut proofs = Vec::new();
    for group in groups {
        let group = group.as_map().ok_or_else(|| malformed("proof group is not a map"))?;
        let id = map_get(group, "i")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing keyset id"))?;
        let entries = map_get(group, "p")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("missing proofs"))?;
        if entries.is_empty() {
            return Err(malformed("empty proof group"));
        }

        for entry in entries {
            let entry = entry.as_map().ok_or_else(|| malformed("proof is not a map"))?;
            let amount = map_get(entry, "a")
                .and_then(Value::as_integer)
                .and_then(|i| u64::try_from(i).ok())
                .ok_or_else(|| malformed("proof amount missing or out of range"))?;
            let secret = map_get(entry, "s")
                .and_then(Value::as_text)
                .ok_or_else(|| malformed("proof secret missing"))?;
            let c = map_get(entry, "c")
                .and_then(Value::as_bytes)
                .ok_or_else(|| malformed("proof signature missing"))?;

            proofs.push(Proof {
                id: hex::encode(id),
                amount,
                secret: secret.to_string(),
                c: hex::encode(c),
                mint_url: String::new(),
            });
        }
    }

    Ok(Token {
        mint_url: normalize_mint_url(mint_url),
        unit: CurrencyUnit::from(unit),
        proofs,
        memo,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenV3 {
    token: Vec<TokenV3Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenV3Entry {
    mint: String,
    proofs: Vec<TokenV3Proof>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenV3Proof {
    id: String,
    amount: u64,
    secret: String,
    #[serde(rename = "C")]
    c: String,
}

fn decode_v3(bytes: &[u8]) -> CashuResult<Token> {
    let body: TokenV3 = serde_json::from_slice(bytes).map_err(|e| malformed(format!("invalid V3 JSON: {}", e)))?;

    let mut entries = body.token.into_iter();
    let first = entries.next().ok_or_else(|| malformed("token contains no mint entries"))?;
    let mint_url = normalize_mint_url(&first.mint);
    if first.mint.trim().is_empty() {
        return Err(malformed("missing mint url"));
    }

    let mut proofs: Vec<Proof> = Vec::new();
    let mut push = |entry_proofs: Vec<TokenV3Proof>| {
        proofs.extend(entry_proofs.into_iter().map(|p| Proof {
            id: p.id,
            amount: p.amount,
            secret: p.secret,
            c: p.c,
            mint_url: String::new(),
        }))
    };
    push(first.proofs);
    for entry in entries {
        if normalize_mint_url(&entry.mint) != mint_url {
            // A Token holds one mint; dropping the rest would lose proofs
            return Err(malformed("multi-mint tokens are not supported"));
        }
        push(entry.proofs);
    }

    Ok(Token {
        mint_url,
        unit: body.unit.as_deref().map(CurrencyUnit::from).unwrap_or_default(),
        proofs,
        memo: body.memo,
    })
}

/// Encode a legacy V3 token, for peers that cannot read V4
pub fn encode_token_v3(proofs: &[Proof], mint_url: &str, unit: &CurrencyUnit, memo: Option<&str>) -> CashuResult<String> {
    if proofs.is_empty() {
        return Err(malformed("cannot encode a token without proofs"));
    }
    for proof in proofs {
        validate_proof(proof)?;
    }
    let body = TokenV3 {
        token: vec![TokenV3Entry {
            mint: mint_url.to_string(),
            proofs: proofs
                .iter()
                .map(|p| TokenV3Proof {
                    id: p.id.clone(),
                    amount: p.amount,
                    secret: p.secret.clone(),
                    c: p.c.clone(),
                })
                .collect(),
        }],
        unit: Some(unit.as_str().to_string()),
        memo: memo.map(str::to_string),
    };
    let json = serde_json::to_vec(&body).map_err(|e| CashuWalletError::Internal(format!("V3 encoding failed: {}", e)))?;
    Ok(format!("{}{}", TokenFormat::V3.prefix(), URL_SAFE_NO_PAD.encode(json)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINT: &str = "https://mint.example.com";

    fn proof(id: &str, amount: u64, secret: &str) -> Proof {
        Proof {
            id: id.to_string(),
            amount,
            secret: secret.to_string(),
            c: "02bc9097997d81afb2cc7346b5e4345a9346bd2a506eb7958598a72f0cf85163ea".to_string(),
            mint_url: MINT.to_string(),
        }
    }

    #[test]
    fn test_v4_roundtrip_preserves_order_across_keysets() {
        let proofs = vec![
            proof("00ad268c4d1f5826", 4, "a"),
            proof("00ffd48b8f5ecf80", 8, "b"),
            proof("00ad268c4d1f5826", 16, "c"),
        ];
        let encoded = encode_token(&proofs, MINT, &CurrencyUnit::Sat, Some("thanks")).unwrap();
        assert!(encoded.starts_with("cashuB"));

        let token = decode_token(&encoded).unwrap();
        assert_eq!(token.proofs, proofs);
        assert_eq!(token.mint_url, MINT);
        assert_eq!(token.unit, CurrencyUnit::Sat);
        assert_eq!(token.memo.as_deref(), Some("thanks"));
        assert_eq!(token.value(), Some(28));
    }

    #[test]
    fn test_decode_accepts_uri_prefix_and_whitespace() {
        let encoded = encode_token(&[proof("00ad268c4d1f5826", 1, "s")], MINT, &CurrencyUnit::Sat, None).unwrap();
        let (head, tail) = encoded.split_at(20);
        let wrapped = format!("  cashu:{}\n{}  ", head, tail);
        assert_eq!(decode_token(&wrapped).unwrap().value(), Some(1));
    }

    #[test]
    fn test_v3_decode() {
        let json = r#"{"token":[{"mint":"https://8333.space:3338","proofs":[{"amount":2,"id":"009a1f293253e41e","secret":"407915bc212be61a77e3e6d2aeb4c727980bda51cd06a6afc29e2861768a7837","C":"02bc9097997d81afb2cc7346b5e4345a9346bd2a506eb7958598a72f0cf85163ea"},{"amount":8,"id":"009a1f293253e41e","secret":"fe15109314e61d7756b0f8ee0f23a624acaa3f4e042f61433c728c7057b931be","C":"029e8e5050b890a7d6c0968db16bc1d5d5fa040ea1de284f6ec69d61299f671059"}]}],"unit":"sat","memo":"Thank you."}"#;
        let encoded = format!("cashuA{}", URL_SAFE_NO_PAD.encode(json));
        let token = decode_token(&encoded).unwrap();
        assert_eq!(token.mint_url, "https://8333.space:3338");
        assert_eq!(token.value(), Some(10));
        assert_eq!(token.memo.as_deref(), Some("Thank you."));
        assert!(token.proofs.iter().all(|p| p.mint_url == token.mint_url));
    }

    #[test]
    fn test_v3_roundtrip() {
        let proofs = vec![proof("009a1f293253e41e", 2, "x"), proof("009a1f293253e41e", 8, "y")];
        let encoded = encode_token_v3(&proofs, MINT, &CurrencyUnit::Sat, None).unwrap();
        assert_eq!(decode_token(&encoded).unwrap().proofs, proofs);
    }

    #[test]
    fn test_v3_multi_mint_rejected() {
        let json = r#"{"token":[{"mint":"https://a.example","proofs":[{"amount":1,"id":"00","secret":"s1","C":"02"}]},{"mint":"https://b.example","proofs":[{"amount":1,"id":"00","secret":"s2","C":"02"}]}]}"#;
        let encoded = format!("cashuA{}", URL_SAFE_NO_PAD.encode(json));
        assert!(matches!(decode_token(&encoded), Err(CashuWalletError::MalformedToken { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        assert_eq!(
            decode_token("cashuCabc").unwrap_err(),
            CashuWalletError::UnsupportedVersion {
                version: "C".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_inputs() {
        for input in ["", "hello", "cashu", "cashuB!!!", "cashuBAAAA", "cashuA", "creqAabc"] {
            let err = decode_token(input).unwrap_err();
            assert_eq!(err.kind(), crate::stores::cashu::errors::ErrorKind::MalformedToken, "{input}");
        }
    }

    #[test]
    fn test_zero_amount_rejected() {
        let json = r#"{"token":[{"mint":"https://a.example","proofs":[{"amount":0,"id":"00","secret":"s1","C":"02"}]}]}"#;
        let encoded = format!("cashuA{}", URL_SAFE_NO_PAD.encode(json));
        assert!(matches!(decode_token(&encoded), Err(CashuWalletError::MalformedToken { .. })));
    }

    #[test]
    fn test_legacy_keyset_id_falls_back_to_v3() {
        let proofs = vec![proof("I2yN+iRYfkzT", 2, "x"), proof("009a1f293253e41e", 8, "y")];
        let encoded = encode_token(&proofs, MINT, &CurrencyUnit::Sat, Some("old")).unwrap();
        assert!(encoded.starts_with("cashuA"));

        let token = decode_token(&encoded).unwrap();
        assert_eq!(token.proofs, proofs);
        assert_eq!(token.memo.as_deref(), Some("old"));
    }

    #[test]
    fn test_uppercase_signature_is_kept_verbatim() {
        let mut upper = proof("00ad268c4d1f5826", 4, "u");
        upper.c = upper.c.to_uppercase();
        let encoded = encode_token(&[upper.clone()], MINT, &CurrencyUnit::Sat, None).unwrap();
        assert!(encoded.starts_with("cashuA"));
        assert_eq!(decode_token(&encoded).unwrap().proofs, vec![upper]);
    }

    #[test]
    fn test_encode_rejects_empty() {
        assert!(encode_token(&[], MINT, &CurrencyUnit::Sat, None).is_err());
    }

    fn proof_strategy() -> impl Strategy<Value = Proof> {
        (
            prop_oneof![Just("00ad268c4d1f5826"), Just("00ffd48b8f5ecf80")],
            1u64..=1 << 20,
            "[a-f0-9]{8,64}",
            proptest::collection::vec(any::<u8>(), 33),
        )
            .prop_map(|(id, amount, secret, c)| Proof {
                id: id.to_string(),
                amount,
                secret,
                c: hex::encode(c),
                mint_url: MINT.to_string(),
            })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            proofs in proptest::collection::vec(proof_strategy(), 1..12),
            memo in proptest::option::of("[ -~]{0,40}"),
        ) {
            let encoded = encode_token(&proofs, MINT, &CurrencyUnit::Sat, memo.as_deref()).unwrap();
            let token = decode_token(&encoded).unwrap();
            prop_assert_eq!(token.proofs, proofs);
            prop_assert_eq!(token.memo, memo);
        }
    }
}
