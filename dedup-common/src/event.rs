//! Customer events exchanged over the broker.
//!
//! The same envelope travels both ways: the upstream customer service publishes it when a
//! customer changes, and this worker publishes one per suspected duplicate.
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// A payload that could not be decoded into a `CustomerEvent`.
#[derive(Error, Debug)]
#[error("malformed customer event: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Kind of customer behind a record. Only the two known kinds carry a name and document
/// number on outgoing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CustomerType {
    /// Natural person, "PF" on the wire.
    Individual,
    /// Legal entity, "PJ" on the wire.
    Organization,
    #[default]
    Unknown,
}

impl CustomerType {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            CustomerType::Individual => Some("PF"),
            CustomerType::Organization => Some("PJ"),
            CustomerType::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, CustomerType::Unknown)
    }

    fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "PF" | "PESSOAFISICA" => CustomerType::Individual,
            "PJ" | "PESSOAJURIDICA" => CustomerType::Organization,
            _ => CustomerType::Unknown,
        }
    }
}

impl fmt::Display for CustomerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code().unwrap_or("unknown"))
    }
}

impl Serialize for CustomerType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.code() {
            Some(code) => serializer.serialize_str(code),
            None => serializer.serialize_none(),
        }
    }
}

/// Anything that is not a recognised string code is `Unknown`, never an error.
impl<'de> Deserialize<'de> for CustomerType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(code) => CustomerType::from_code(&code),
            _ => CustomerType::Unknown,
        })
    }
}

/// The customer a `CustomerEvent` is about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomerRecord {
    #[serde(rename = "clienteId", default)]
    pub customer_id: Uuid,
    #[serde(
        rename = "tipoCliente",
        default,
        skip_serializing_if = "CustomerType::is_unknown"
    )]
    pub customer_type: CustomerType,
    #[serde(rename = "documento", default, skip_serializing_if = "String::is_empty")]
    pub document_number: String,
    #[serde(rename = "nome", default, skip_serializing_if = "String::is_empty")]
    pub full_name: String,
    #[serde(rename = "telefone", default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl CustomerRecord {
    /// A record is only worth analyzing when it identifies a customer.
    pub fn has_identity(&self) -> bool {
        !self.customer_id.is_nil()
    }
}

/// Envelope for customer changes and duplicate suspicions alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerEvent {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime"
    )]
    pub timestamp: DateTime<Utc>,
    pub data: CustomerRecord,
}

impl CustomerEvent {
    pub fn from_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

pub fn serialize_datetime<S>(datetime: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&datetime.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

/// Accept RFC 3339 timestamps as well as offset-less ISO 8601 ones, which are read as UTC.
pub fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let formatted: String = Deserialize::deserialize(deserializer)?;

    if let Ok(datetime) = DateTime::parse_from_rfc3339(&formatted) {
        return Ok(datetime.with_timezone(&Utc));
    }

    match NaiveDateTime::parse_from_str(&formatted, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(datetime) => Ok(datetime.and_utc()),
        Err(_) => Err(serde::de::Error::custom(format!(
            "invalid timestamp: {formatted}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn sample_event() -> CustomerEvent {
        CustomerEvent {
            event_id: Uuid::new_v4(),
            event_type: "ClienteAtualizado".to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap(),
            data: CustomerRecord {
                customer_id: Uuid::new_v4(),
                customer_type: CustomerType::Individual,
                document_number: "12345678900".to_owned(),
                full_name: "João Silva".to_owned(),
                phone: "11999999999".to_owned(),
                email: "joao@x.com".to_owned(),
            },
        }
    }

    #[test]
    fn test_event_survives_a_trip_over_the_wire() {
        let event = sample_event();

        let decoded = CustomerEvent::from_slice(&event.to_vec().unwrap()).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn test_unknown_type_and_empty_fields_are_omitted() {
        let mut event = sample_event();
        event.data.customer_type = CustomerType::Unknown;
        event.data.document_number = String::new();
        event.data.full_name = String::new();

        let value = serde_json::to_value(&event).unwrap();
        let data = value["data"].as_object().unwrap();

        assert!(!data.contains_key("tipoCliente"));
        assert!(!data.contains_key("documento"));
        assert!(!data.contains_key("nome"));
        assert_eq!(data["telefone"], "11999999999");
        assert_eq!(
            CustomerEvent::from_slice(&event.to_vec().unwrap()).unwrap(),
            event
        );
    }

    #[test]
    fn test_decodes_upstream_payload() {
        let payload = json!({
            "eventId": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "eventType": "ClienteCriado",
            "timestamp": "2024-05-01T10:30:00.1234567",
            "data": {
                "clienteId": "0b7a1d35-56b3-4c4d-8d0e-8f0d1ee5c2a1",
                "tipoCliente": "PessoaJuridica",
                "documento": "12345678000199",
                "nome": "ACME Ltda"
            }
        });

        let event = CustomerEvent::from_slice(payload.to_string().as_bytes()).unwrap();

        assert_eq!(event.event_type, "ClienteCriado");
        assert_eq!(event.data.customer_type, CustomerType::Organization);
        assert_eq!(event.data.full_name, "ACME Ltda");
        assert_eq!(event.data.email, "");
        assert_eq!(event.data.phone, "");
        assert_eq!(
            event.timestamp.naive_utc(),
            NaiveDateTime::parse_from_str("2024-05-01T10:30:00.1234567", "%Y-%m-%dT%H:%M:%S%.f")
                .unwrap()
        );
    }

    #[test]
    fn test_missing_customer_id_decodes_as_nil() {
        let payload = json!({
            "eventId": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "eventType": "ClienteCriado",
            "timestamp": "2024-05-01T10:30:00Z",
            "data": { "nome": "Sem Id" }
        });

        let event = CustomerEvent::from_slice(payload.to_string().as_bytes()).unwrap();

        assert!(!event.data.has_identity());
    }

    #[test]
    fn test_unrecognised_customer_type_is_unknown() {
        for raw in [json!("XX"), json!(1), json!(null)] {
            let customer_type: CustomerType = serde_json::from_value(raw).unwrap();
            assert_eq!(customer_type, CustomerType::Unknown);
        }
        let pf: CustomerType = serde_json::from_value(json!("pf")).unwrap();
        assert_eq!(pf, CustomerType::Individual);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(CustomerEvent::from_slice(b"not json").is_err());
        assert!(CustomerEvent::from_slice(br#"{"eventId": "nope"}"#).is_err());
    }
}
