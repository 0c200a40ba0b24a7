//! Tests for the protocol module
//!
//! These tests cover service keys, addresses, request/response construction
//! and typed parameter conversion.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn echo_key() -> ServiceKey {
        ServiceKey::new("demo.Echo").with_group("g1").with_version("1.0")
    }

    #[test]
    fn test_service_key_display_and_parse() {
        let key = echo_key();
        assert_eq!(key.to_string(), "demo.Echo#g1#1.0");
        assert_eq!("demo.Echo#g1#1.0".parse::<ServiceKey>().unwrap(), key);
    }

    #[test]
    fn test_service_key_empty_group_and_version() {
        let key = ServiceKey::new("demo.Echo");
        assert_eq!(key.to_string(), "demo.Echo##");
        assert_eq!("demo.Echo##".parse::<ServiceKey>().unwrap(), key);
    }

    #[test]
    fn test_service_key_parse_rejects_wrong_segment_count() {
        assert!("demo.Echo".parse::<ServiceKey>().is_err());
        assert!("a#b#c#d".parse::<ServiceKey>().is_err());
        assert!("#g#v".parse::<ServiceKey>().is_err());
    }

    #[test]
    fn test_service_key_validate() {
        assert!(echo_key().validate().is_ok());
        assert!(ServiceKey::new("").validate().is_err());
        assert!(ServiceKey::new("a/b").validate().is_err());
        assert!(ServiceKey::new("a").with_group("x#y").validate().is_err());
    }

    #[test]
    fn test_service_address_parse() {
        let addr: ServiceAddress = "10.0.0.1:9998".parse().unwrap();
        assert_eq!(addr, ServiceAddress::new("10.0.0.1", 9998));
        assert_eq!(addr.to_string(), "10.0.0.1:9998");

        assert!("10.0.0.1".parse::<ServiceAddress>().is_err());
        assert!(":9998".parse::<ServiceAddress>().is_err());
        assert!("host:99999".parse::<ServiceAddress>().is_err());
    }

    #[test]
    fn test_request_carries_service_identity() {
        let req = RpcRequest::new(&echo_key(), "echo", vec![type_descriptor::<String>()], vec![json!("hi")]);
        assert_eq!(req.interface_name, "demo.Echo");
        assert_eq!(req.group, "g1");
        assert_eq!(req.version, "1.0");
        assert_eq!(req.service_key(), echo_key());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| RpcRequest::new(&echo_key(), "echo", vec![], vec![]).request_id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_response_success() {
        let resp = RpcResponse::success("abc", json!({"result": "ok"}));
        assert!(resp.is_success());
        assert_eq!(resp.code, 200);
        assert_eq!(resp.data, Some(json!({"result": "ok"})));
    }

    #[test]
    fn test_response_success_with_null_has_no_data() {
        let resp = RpcResponse::success("abc", json!(null));
        assert!(resp.is_success());
        assert!(resp.data.is_none());
    }

    #[test]
    fn test_response_fail_codes() {
        let not_found = RpcResponse::fail("a", ResponseCode::ServiceNotFound, "demo.Echo##");
        assert_eq!(not_found.code, 404);
        assert!(not_found.message.contains("demo.Echo##"));
        assert!(!not_found.is_success());

        let failed = RpcResponse::fail("b", ResponseCode::Fail, "boom");
        assert_eq!(failed.code, 500);
        assert!(failed.message.contains("boom"));
        assert!(failed.data.is_none());
    }

    #[test]
    fn test_response_code_lookup() {
        assert_eq!(ResponseCode::from_code(200), Some(ResponseCode::Success));
        assert_eq!(ResponseCode::from_code(404), Some(ResponseCode::ServiceNotFound));
        assert_eq!(ResponseCode::from_code(500), Some(ResponseCode::Fail));
        assert_eq!(ResponseCode::from_code(418), None);
    }

    #[test]
    fn test_message_constructors_copy_request_id() {
        let req = RpcRequest::new(&echo_key(), "echo", vec![], vec![]);
        let id = req.request_id.clone();
        let msg = RpcMessage::request(req, 1, 0);
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.request_id, id);

        let ping = RpcMessage::ping(1, 0);
        assert!(ping.message_type.is_heartbeat());
        assert_eq!(ping.body, MessageBody::Empty);
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Request);
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::HeartbeatPong);
        assert!(matches!(MessageType::try_from(9), Err(RpcError::MalformedFrame(_))));
    }

    // ========================================================================
    // Params
    // ========================================================================

    #[test]
    fn test_params_round_trip_tuple() {
        let values = (1i64, "two".to_string(), vec![3u8]).into_values().unwrap();
        assert_eq!(values, vec![json!(1), json!("two"), json!([3])]);

        let back = <(i64, String, Vec<u8>)>::from_values(values).unwrap();
        assert_eq!(back, (1, "two".to_string(), vec![3]));
    }

    #[test]
    fn test_params_descriptors_distinguish_overloads() {
        let ints = <(i32, i32)>::type_descriptors();
        let strings = <(String,)>::type_descriptors();
        assert_eq!(ints.len(), 2);
        assert_ne!(ints[0], strings[0]);
        assert!(<()>::type_descriptors().is_empty());
    }

    #[test]
    fn test_params_arity_mismatch() {
        let err = <(i32, i32)>::from_values(vec![json!(1)]).unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)));
        assert!(<()>::from_values(vec![json!(1)]).is_err());
    }

    #[test]
    fn test_params_type_mismatch() {
        let err = <(i32,)>::from_values(vec![json!("not a number")]).unwrap_err();
        assert!(matches!(err, RpcError::JsonSerialization(_)));
    }
}
