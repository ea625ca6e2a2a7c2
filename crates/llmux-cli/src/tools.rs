//! Demo tools offered to the model with `--tools`.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use llmux_engine::tools::VIEW_IMAGE;
use llmux_engine::{FunctionDeclaration, JsonMap, Prompt, Schema, handler_fn};
use serde_json::{Value, json};

use crate::helpers::mime_type_for;

pub const CURRENT_TIME: &str = "current_time";

/// Add every demo tool to `prompt`.
pub fn register(prompt: Prompt) -> Prompt {
    prompt
        .with_tool(
            FunctionDeclaration::new(CURRENT_TIME, "Current local date and time (RFC 3339)"),
            handler_fn(|_cancel, _args| async move { Ok(current_time()) }),
        )
        .with_tool(
            FunctionDeclaration::new(VIEW_IMAGE, "Load an image file so you can look at it")
                .with_parameters(Schema::object(
                    [(
                        "path",
                        Schema::string().with_description("Path to the image file"),
                    )],
                    &["path"],
                )),
            handler_fn(|_cancel, args| async move {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(view_image(&path).await)
            }),
        )
}

fn current_time() -> JsonMap {
    let mut out = JsonMap::new();
    out.insert("now".into(), json!(chrono::Local::now().to_rfc3339()));
    out
}

/// Read an image into the payload shape the executor lifts into a media
/// message.  Failures are reported to the model, not raised.
async fn view_image(path: &str) -> JsonMap {
    let mut out = JsonMap::new();
    out.insert("path".into(), json!(path));

    let mime_type = mime_type_for(Path::new(path));
    if !mime_type.starts_with("image/") {
        out.insert("success".into(), json!(false));
        out.insert("error".into(), json!(format!("not an image: {path}")));
        return out;
    }

    match tokio::fs::read(path).await {
        Ok(data) => {
            out.insert("success".into(), json!(true));
            out.insert("mime_type".into(), json!(mime_type));
            out.insert("size_bytes".into(), json!(data.len()));
            out.insert("data_base64".into(), json!(BASE64.encode(&data)));
        }
        Err(e) => {
            tracing::warn!(path, error = %e, "viewImage failed");
            out.insert("success".into(), json!(false));
            out.insert("error".into(), json!(e.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_images_are_refused() {
        let out = view_image("notes.txt").await;
        assert_eq!(out["success"], false);
        assert!(out.get("data_base64").is_none());
    }

    #[tokio::test]
    async fn missing_file_reports_error() {
        let out = view_image("/nonexistent/llmux-test.png").await;
        assert_eq!(out["success"], false);
        assert!(out["error"].as_str().is_some());
    }

    #[test]
    fn clock_returns_timestamp() {
        let out = current_time();
        assert!(out["now"].as_str().is_some_and(|s| s.contains('T')));
    }
}
