use crate::errors::ReplayError;
use crate::logging::append_run_log;
use serde_json::{json, Value};

pub const EXPECTED_STATUS: u16 = 200;
pub const SAMPLE_PATH: &str = "/post?name=hello";

/// The httpbin echo captured in the sample flow for `POST /post?name=hello`.
pub fn expected_payload() -> Value {
    json!({
        "args": {"name": "hello"},
        "data": "",
        "files": {},
        "form": {},
        "headers": {
            "Accept": "*/*",
            "Host": "httpbin.org",
            "User-Agent": "curl/8.7.1",
            "X-Amzn-Trace-Id": "Root=1-697a0994-040811514e208084388cf736",
        },
        "json": null,
        "origin": "167.103.72.120",
        "url": "https://httpbin.org/post?name=hello",
    })
}

/// Checks a replayed response against `expected`. Objects compare without
/// regard to key order; arrays compare element by element.
pub fn verify_response(status: u16, body: &[u8], expected: &Value) -> Result<(), ReplayError> {
    if status != EXPECTED_STATUS {
        append_run_log("error", "verify.unexpected_status", json!({ "status": status }));
        return Err(ReplayError::VerificationMismatch {
            detail: format!(
                "Unexpected status: {status}\n{}",
                String::from_utf8_lossy(body)
            ),
        });
    }

    let actual: Value = serde_json::from_slice(body).map_err(|e| {
        append_run_log("error", "verify.invalid_json", json!({ "error": e.to_string() }));
        ReplayError::VerificationMismatch {
            detail: format!(
                "Response body is not JSON: {e}\n{}",
                String::from_utf8_lossy(body)
            ),
        }
    })?;

    if &actual != expected {
        let differing = differing_paths(expected, &actual, "$");
        append_run_log(
            "error",
            "verify.mismatch",
            json!({ "paths": differing }),
        );
        return Err(ReplayError::VerificationMismatch {
            detail: render_diff(expected, &actual, &differing),
        });
    }

    append_run_log("info", "verify.matched", json!({ "status": status }));
    Ok(())
}

fn render_diff(expected: &Value, actual: &Value, differing: &[String]) -> String {
    let pretty = |value: &Value| {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    };
    format!(
        "Differing fields: {}\nExpected:\n{}\nActual:\n{}",
        differing.join(", "),
        pretty(expected),
        pretty(actual)
    )
}

/// JSON paths where `actual` departs from `expected`.
pub fn differing_paths(expected: &Value, actual: &Value, path: &str) -> Vec<String> {
    match (expected, actual) {
        (Value::Object(want), Value::Object(got)) => {
            let mut keys = want.keys().chain(got.keys()).collect::<Vec<_>>();
            keys.sort();
            keys.dedup();
            keys.into_iter()
                .flat_map(|key| {
                    let child = format!("{path}.{key}");
                    match (want.get(key), got.get(key)) {
                        (Some(w), Some(g)) => differing_paths(w, g, &child),
                        _ => vec![child],
                    }
                })
                .collect()
        }
        (Value::Array(want), Value::Array(got)) if want.len() == got.len() => want
            .iter()
            .zip(got)
            .enumerate()
            .flat_map(|(i, (w, g))| differing_paths(w, g, &format!("{path}[{i}]")))
            .collect(),
        _ if expected == actual => Vec::new(),
        _ => vec![path.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::{differing_paths, expected_payload, verify_response};
    use crate::errors::ReplayError;
    use serde_json::json;

    #[test]
    fn matching_body_in_any_key_order_passes() {
        let body = br#"{"url":"https://httpbin.org/post?name=hello","origin":"167.103.72.120",
            "json":null,"headers":{"X-Amzn-Trace-Id":"Root=1-697a0994-040811514e208084388cf736",
            "User-Agent":"curl/8.7.1","Host":"httpbin.org","Accept":"*/*"},
            "form":{},"files":{},"data":"","args":{"name":"hello"}}"#;
        verify_response(200, body, &expected_payload()).expect("match");
    }

    #[test]
    fn wrong_status_is_a_mismatch_with_body() {
        let err = verify_response(502, b"bad gateway", &expected_payload()).expect_err("status");
        let ReplayError::VerificationMismatch { detail } = err else {
            panic!("unexpected error kind");
        };
        assert!(detail.contains("Unexpected status: 502"));
        assert!(detail.contains("bad gateway"));
    }

    #[test]
    fn field_difference_renders_expected_and_actual() {
        let mut actual = expected_payload();
        actual["args"]["name"] = json!("world");
        let body = serde_json::to_vec(&actual).expect("encode");
        let err = verify_response(200, &body, &expected_payload()).expect_err("mismatch");
        let text = err.to_string();
        assert!(text.contains("Differing fields: $.args.name"));
        assert!(text.contains("Expected:"));
        assert!(text.contains("\"world\""));
    }

    #[test]
    fn arrays_are_order_sensitive() {
        let paths = differing_paths(&json!({"a": [1, 2]}), &json!({"a": [2, 1]}), "$");
        assert_eq!(paths, vec!["$.a[0]".to_string(), "$.a[1]".to_string()]);
        assert!(differing_paths(&json!([1]), &json!([1, 2]), "$") == vec!["$".to_string()]);
    }

    #[test]
    fn non_json_body_is_reported() {
        let err = verify_response(200, b"<html>", &expected_payload()).expect_err("json");
        assert!(err.to_string().contains("not JSON"));
    }
}
