//! 类型化记录
//!
//! 共享同一个 collection 的不同记录类型靠 `type` 字段区分。
//! [`encode`] 写入判别字段，[`decode`] 校验它。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// 判别字段名
pub const TYPE_FIELD: &str = "type";

/// 可存入文档库的记录类型
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 判别字段值
    const KIND: &'static str;

    /// 业务 ID（记录自带，区别于存储内部 ID）
    fn id(&self) -> &str;
}

/// 记录 → 自描述 JSON（按字段名，附带判别字段）
pub fn encode<T: Entity>(record: &T) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert(TYPE_FIELD.to_string(), Value::String(T::KIND.to_string()));
        }
        None => {
            return Err(Error::Decode {
                kind: T::KIND,
                reason: "记录必须序列化为 JSON 对象".into(),
            })
        }
    }
    Ok(value)
}

/// JSON → 记录；判别字段缺失或不匹配时返回 [`Error::Decode`]
pub fn decode<T: Entity>(value: &Value) -> Result<T> {
    match value.get(TYPE_FIELD).and_then(Value::as_str) {
        Some(kind) if kind == T::KIND => {}
        Some(other) => {
            return Err(Error::Decode {
                kind: T::KIND,
                reason: format!("判别字段不匹配: {}", other),
            })
        }
        None => {
            return Err(Error::Decode {
                kind: T::KIND,
                reason: "缺少判别字段".into(),
            })
        }
    }

    T::deserialize(value).map_err(|e| Error::Decode {
        kind: T::KIND,
        reason: e.to_string(),
    })
}

/// 酒店
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub country: String,
}

impl Hotel {
    /// 新酒店（生成 uuid）
    pub fn new(name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: None,
            city: None,
            phone: None,
            country: country.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

impl Entity for Hotel {
    const KIND: &'static str = "hotel";

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_adds_discriminator() {
        let hotel = Hotel::new("Beachside Inn", "France").with_city("Nice");
        let value = encode(&hotel).unwrap();

        assert_eq!(value["type"], "hotel");
        assert_eq!(value["name"], "Beachside Inn");
        assert_eq!(value["city"], "Nice");
        // 未设置的可选字段不写入
        assert!(value.get("phone").is_none());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let value = json!({
            "type": "hotel",
            "id": "h1",
            "name": "Mountain Lodge",
            "country": "Switzerland",
            "vacancy": true
        });
        let hotel: Hotel = decode(&value).unwrap();
        assert_eq!(hotel.id, "h1");
        assert_eq!(hotel.address, None);
    }

    #[test]
    fn test_decode_rejects_wrong_kind() {
        let value = json!({"type": "airline", "id": "a1", "name": "X", "country": "US"});
        assert!(matches!(decode::<Hotel>(&value), Err(Error::Decode { .. })));

        let value = json!({"id": "a1", "name": "X", "country": "US"});
        assert!(decode::<Hotel>(&value).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_required_field() {
        let value = json!({"type": "hotel", "id": "h1", "name": "No Country"});
        let err = decode::<Hotel>(&value).unwrap_err();
        assert!(err.to_string().contains("country"));
    }
}
