//! 캐시 키 생성.
//!
//! 키 형식: `{source}:{params_json}:{plan}:{scope}`
//!
//! `scope`는 자격 증명이 없으면 `anon`, 있으면 비밀값 SHA-256의 앞 16자리입니다.
//! 서로 다른 자격 증명이 같은 엔트리를 공유하지 않도록 하면서 비밀값 자체는 키에 남기지 않습니다.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

const DEFAULT_PLAN: &str = "default";
const ANONYMOUS_SCOPE: &str = "anon";
const SCOPE_HEX_LEN: usize = 16;

/// 캐시 키 빌더.
pub struct CacheKey;

impl CacheKey {
    /// 데이터 소스, 요청 파라미터, 구독 플랜, 자격 증명으로 키를 만듭니다.
    ///
    /// 파라미터는 serde 직렬화 결과를 그대로 사용하므로 필드 순서가 고정된 구조체를 넘겨야 합니다.
    pub fn compose<P: Serialize + ?Sized>(
        source: &str,
        params: &P,
        plan: Option<&str>,
        credential: Option<&SecretString>,
    ) -> Result<String> {
        let params = serde_json::to_string(params)?;
        let plan = plan.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PLAN);
        let scope = credential
            .map(Self::credential_scope)
            .unwrap_or_else(|| ANONYMOUS_SCOPE.to_string());

        Ok(format!("{}:{}:{}:{}", source, params, plan, scope))
    }

    /// 자격 증명 해시 접두어.
    pub fn credential_scope(credential: &SecretString) -> String {
        let digest = Sha256::digest(credential.expose_secret().as_bytes());
        let mut scope = hex::encode(digest);
        scope.truncate(SCOPE_HEX_LEN);
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anonymous_key_layout() {
        let key = CacheKey::compose("bitunix", &json!({"symbol": "BTCUSDT"}), None, None).unwrap();
        assert_eq!(key, r#"bitunix:{"symbol":"BTCUSDT"}:default:anon"#);
    }

    #[test]
    fn test_credentials_isolate_entries() {
        let params = json!({"symbol": "BTCUSDT", "interval": "1m"});
        let a = SecretString::from("key-a".to_string());
        let b = SecretString::from("key-b".to_string());

        let key_a = CacheKey::compose("rest", &params, Some("pro"), Some(&a)).unwrap();
        let key_b = CacheKey::compose("rest", &params, Some("pro"), Some(&b)).unwrap();
        let anon = CacheKey::compose("rest", &params, Some("pro"), None).unwrap();

        assert_ne!(key_a, key_b);
        assert_ne!(key_a, anon);
        assert!(!key_a.contains("key-a"));
        assert_eq!(key_a.rsplit(':').next().unwrap().len(), SCOPE_HEX_LEN);
    }

    #[test]
    fn test_plan_distinguishes_keys() {
        let params = json!({"symbol": "ETHUSDT"});
        let free = CacheKey::compose("rest", &params, Some("free"), None).unwrap();
        let pro = CacheKey::compose("rest", &params, Some("pro"), None).unwrap();
        assert_ne!(free, pro);

        let empty = CacheKey::compose("rest", &params, Some(""), None).unwrap();
        assert!(empty.ends_with(":default:anon"));
    }
}
