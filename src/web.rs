//! 画像アップロードページ
//!
//! `GET /` でフォームを表示し、`POST /` で受け取った画像を分類して結果を表示します。

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use minijinja::Environment;
use serde::Serialize;

use crate::dataset::has_supported_extension;
use crate::error::DetectorError;
use crate::prediction::Prediction;
use crate::serving::Predictor;

/// フォームのファイルフィールド名
pub const UPLOAD_FIELD: &str = "imageFile";

pub const MSG_NO_FILE: &str = "Please select an image to upload.";
pub const MSG_BAD_EXTENSION: &str = "Only JPEG and PNG images are supported.";
pub const MSG_MODEL_NOT_FOUND: &str = "Model not found. Please train the model first.";
pub const MSG_MODEL_INVALID: &str = "The model file could not be loaded. Please retrain the model.";

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Hard Hat Detector</title>
  <style>
    body { font-family: sans-serif; max-width: 720px; margin: 2rem auto; }
    .error { color: #b00020; }
    .hard_hat { color: #1b7f3b; }
    .no_hard_hat { color: #b00020; }
    table { border-collapse: collapse; }
    td, th { padding: 4px 12px; border-bottom: 1px solid #ddd; text-align: left; }
    img { max-width: 320px; margin-top: 1rem; }
  </style>
</head>
<body>
  <h1>Hard Hat Detector</h1>
  <form method="post" action="/" enctype="multipart/form-data">
    <input type="file" name="imageFile" accept=".jpg,.jpeg,.png">
    <button type="submit">Classify</button>
  </form>
  {% if error_message %}
  <p class="error">{{ error_message }}</p>
  {% endif %}
  {% if image_data_uri %}
  <img src="{{ image_data_uri }}" alt="uploaded image">
  {% endif %}
  {% if result %}
  <h2 class="{{ result.predicted_label }}">{{ result.predicted_label }}</h2>
  <p>Confidence: {{ result.confidence }}</p>
  <table>
    <tr><th>Class</th><th>Probability</th></tr>
    {% for row in result.probabilities %}
    <tr><td>{{ row.label }}</td><td>{{ row.percent }}</td></tr>
    {% endfor %}
  </table>
  {% endif %}
</body>
</html>
"#;

const ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Error</title></head>
<body>
  <h1>{{ status }}</h1>
  <p>{{ message }}</p>
  <p><a href="/">Back to upload</a></p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct WebState {
    predictor: Arc<dyn Predictor>,
    templates: Arc<Environment<'static>>,
}

#[derive(Debug, Serialize)]
struct ProbabilityRow {
    label: String,
    percent: String,
}

#[derive(Debug, Serialize)]
struct ResultView {
    predicted_label: String,
    confidence: String,
    probabilities: Vec<ProbabilityRow>,
}

impl From<&Prediction> for ResultView {
    fn from(prediction: &Prediction) -> Self {
        Self {
            predicted_label: prediction.predicted_label.clone(),
            confidence: percent(prediction.confidence()),
            // キー順（モデルファイルに保存された順）のまま並べる
            probabilities: prediction
                .probabilities()
                .map(|(label, score)| ProbabilityRow {
                    label: label.to_string(),
                    percent: percent(score),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct PageView {
    error_message: Option<String>,
    image_data_uri: Option<String>,
    result: Option<ResultView>,
}

fn percent(score: f32) -> String {
    format!("{:.1}%", score * 100.0)
}

fn templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("index.html", INDEX_TEMPLATE)?;
    env.add_template("error.html", ERROR_TEMPLATE)?;
    Ok(env)
}

/// ルーターを構築
pub fn router(
    predictor: Arc<dyn Predictor>,
    max_upload_bytes: usize,
) -> Result<Router, minijinja::Error> {
    let state = WebState {
        predictor,
        templates: Arc::new(templates()?),
    };

    Ok(Router::new()
        .route("/", get(index).post(upload))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state))
}

/// アップロードされたファイルの検証
pub fn validate_upload(file_name: Option<&str>, bytes: &[u8]) -> Result<(), DetectorError> {
    let Some(file_name) = file_name.filter(|name| !name.is_empty()) else {
        return Err(DetectorError::Validation(MSG_NO_FILE.to_string()));
    };
    if bytes.is_empty() {
        return Err(DetectorError::Validation(MSG_NO_FILE.to_string()));
    }
    if !has_supported_extension(std::path::Path::new(file_name)) {
        return Err(DetectorError::Validation(MSG_BAD_EXTENSION.to_string()));
    }
    Ok(())
}

/// 推論エラーを画面表示用のステータスとメッセージに変換
pub fn error_response(error: &DetectorError) -> (StatusCode, String) {
    match error {
        DetectorError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
        DetectorError::ArtifactNotFound(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, MSG_MODEL_NOT_FOUND.to_string())
        }
        DetectorError::Artifact { message, .. } => {
            tracing::error!("model file could not be loaded: {}", message);
            (StatusCode::SERVICE_UNAVAILABLE, MSG_MODEL_INVALID.to_string())
        }
        DetectorError::Prediction(message) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Prediction failed: {}", message),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Prediction failed: {}", other),
        ),
    }
}

fn render_page(state: &WebState, status: StatusCode, view: &PageView) -> Response {
    render(state, "index.html", status, view)
}

fn render<S: Serialize>(state: &WebState, name: &str, status: StatusCode, ctx: S) -> Response {
    let rendered = state
        .templates
        .get_template(name)
        .and_then(|template| template.render(ctx));

    match rendered {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            tracing::error!("failed to render {}: {:#}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn index(State(state): State<WebState>) -> Response {
    render_page(&state, StatusCode::OK, &PageView::default())
}

async fn not_found(State(state): State<WebState>) -> Response {
    render(
        &state,
        "error.html",
        StatusCode::NOT_FOUND,
        minijinja::context! {
            status => StatusCode::NOT_FOUND.as_u16(),
            message => "The page you requested does not exist.",
        },
    )
}

/// アップロード1件分
struct Upload {
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Option<Upload>, (StatusCode, String)> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| (e.status(), format!("The upload could not be read: {}", e.body_text())))?;
        let Some(field) = field else {
            return Ok(None);
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (e.status(), format!("The upload could not be read: {}", e.body_text())))?;

        return Ok(Some(Upload {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        }));
    }
}

fn preview_uri(upload: &Upload) -> String {
    let content_type = upload
        .content_type
        .clone()
        .filter(|ct| ct.starts_with("image/"))
        .unwrap_or_else(|| {
            let is_png = upload
                .file_name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().ends_with(".png"));
            let mime = if is_png { "image/png" } else { "image/jpeg" };
            mime.to_string()
        });
    format!("data:{};base64,{}", content_type, STANDARD.encode(&upload.bytes))
}

async fn upload(
    State(state): State<WebState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    // multipart/form-data 以外のリクエストもフォーム付きのページで返す
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!("rejected upload: {}", rejection.body_text());
            let view = PageView {
                error_message: Some(rejection.body_text()),
                ..Default::default()
            };
            return render_page(&state, rejection.status(), &view);
        }
    };

    let upload = match read_upload(&mut multipart).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            let view = PageView {
                error_message: Some(MSG_NO_FILE.to_string()),
                ..Default::default()
            };
            return render_page(&state, StatusCode::BAD_REQUEST, &view);
        }
        Err((status, message)) => {
            let view = PageView {
                error_message: Some(message),
                ..Default::default()
            };
            return render_page(&state, status, &view);
        }
    };

    if let Err(e) = validate_upload(upload.file_name.as_deref(), &upload.bytes) {
        let (status, message) = error_response(&e);
        let view = PageView {
            error_message: Some(message),
            ..Default::default()
        };
        return render_page(&state, status, &view);
    }

    let image_data_uri = Some(preview_uri(&upload));
    let predictor = state.predictor.clone();
    let bytes = upload.bytes;
    let result = tokio::task::spawn_blocking(move || predictor.predict(&bytes))
        .await
        .unwrap_or_else(|e| Err(DetectorError::Prediction(format!("prediction task failed: {}", e))));

    match result {
        Ok(prediction) => {
            tracing::info!(
                file = upload.file_name.as_deref().unwrap_or_default(),
                label = %prediction.predicted_label,
                confidence = prediction.confidence(),
                "prediction served"
            );
            let view = PageView {
                image_data_uri,
                result: Some(ResultView::from(&prediction)),
                ..Default::default()
            };
            render_page(&state, StatusCode::OK, &view)
        }
        Err(e) => {
            tracing::warn!("prediction failed: {}", e);
            let (status, message) = error_response(&e);
            let view = PageView {
                error_message: Some(message),
                image_data_uri,
                ..Default::default()
            };
            render_page(&state, status, &view)
        }
    }
}
