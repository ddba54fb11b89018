use reqwest::header::{AUTHORIZATION, HeaderName};
use serde_json::{Map, Value};

#[test]
fn builds_bearer_auth_header() {
	let headers =
		sift_providers::auth_headers("secret", &Map::new()).expect("Failed to build headers.");
	let value = headers.get(AUTHORIZATION).expect("Missing authorization header.");

	assert_eq!(value, "Bearer secret");
}

#[test]
fn forwards_default_headers() {
	let mut defaults = Map::new();

	defaults.insert("x-tenant".to_string(), Value::String("acme".to_string()));

	let headers = sift_providers::auth_headers("secret", &defaults).expect("Failed to build headers.");
	let value = headers.get(HeaderName::from_static("x-tenant")).expect("Missing default header.");

	assert_eq!(value, "acme");
}

#[test]
fn rejects_non_string_default_header() {
	let mut defaults = Map::new();

	defaults.insert("x-retries".to_string(), Value::from(3));

	let err = sift_providers::auth_headers("secret", &defaults).expect_err("Expected invalid header.");

	assert!(matches!(err, sift_providers::Error::InvalidConfig { .. }));
}
