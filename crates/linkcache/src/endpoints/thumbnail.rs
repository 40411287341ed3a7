use axum::extract;
use axum::http::{Uri, header};
use axum::response::{IntoResponse, Response};
use linkcache_service::responses::{LinkResolverResponse, Payload};
use linkcache_service::services::SharedServices;
use percent_encoding::percent_decode_str;

use crate::endpoints::ResponseError;

const PREFIX: &str = "/thumbnail/";

fn payload_response(payload: Payload) -> Response {
    ([(header::CONTENT_TYPE, payload.content_type)], payload.body).into_response()
}

/// Extracts the link from the raw request path.
///
/// The link is percent-decoded once, so both escaped and plain links work.
fn decode_link(uri: &Uri) -> Option<String> {
    let encoded = uri.path().strip_prefix(PREFIX)?;
    let link = percent_decode_str(encoded).decode_utf8().ok()?;
    Some(link.into_owned())
}

pub async fn handle_thumbnail_request(
    extract::State(services): extract::State<SharedServices>,
    uri: Uri,
) -> Result<Response, ResponseError> {
    let Some(link) = decode_link(&uri) else {
        let payload = LinkResolverResponse::invalid_url().to_payload();
        return Ok(payload_response(payload));
    };

    let span = tracing::info_span!("thumbnail", link = %link);
    let payload = services.thumbnails.get(&link, span).await?;

    Ok(payload_response(payload))
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;
    use crate::test;

    #[test]
    fn test_decode_link() {
        let uri: Uri = "/thumbnail/https%3A%2F%2Fexample.com%2Fa%20b.png".parse().unwrap();
        assert_eq!(decode_link(&uri).unwrap(), "https://example.com/a b.png");

        let uri: Uri = "/thumbnail/https://example.com/cat.png".parse().unwrap();
        assert_eq!(decode_link(&uri).unwrap(), "https://example.com/cat.png");

        let uri: Uri = "/thumbnail/%FF%FE".parse().unwrap();
        assert_eq!(decode_link(&uri), None);
    }

    #[tokio::test]
    async fn test_thumbnail() {
        linkcache_test::setup();
        let (server, upstream) = test::server().await;
        upstream.accesses();

        let link = upstream.url("image/png/600/600/cat.png");
        let encoded = percent_encoding::utf8_percent_encode(
            link.as_str(),
            percent_encoding::NON_ALPHANUMERIC,
        );
        let url = server.url(&format!("thumbnail/{encoded}"));

        let response = reqwest::get(url.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/webp");
        let first = response.bytes().await.unwrap();
        assert!(!first.is_empty());

        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.bytes().await.unwrap(), first);

        assert_eq!(upstream.accesses(), 1);
    }

    #[tokio::test]
    async fn test_thumbnail_not_found() {
        linkcache_test::setup();
        let (server, upstream) = test::server().await;

        let link = upstream.url("respond_statuscode/404/missing.png");
        let response = reqwest::get(server.url(&format!("thumbnail/{link}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        let body: LinkResolverResponse = response.json().await.unwrap();
        assert_eq!(body, LinkResolverResponse::no_link_info_found());
    }

    #[tokio::test]
    async fn test_thumbnail_invalid_url() {
        linkcache_test::setup();
        let (server, _upstream) = test::server().await;

        let response = reqwest::get(server.url("thumbnail/%FF%FE")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        insta::assert_snapshot!(
            response.text().await.unwrap(),
            @r#"{"status":500,"message":"Could not fetch link info: Invalid URL"}"#
        );

        let response = reqwest::get(server.url("thumbnail/not%20a%20url")).await.unwrap();
        let body: LinkResolverResponse = response.json().await.unwrap();
        assert_eq!(body, LinkResolverResponse::invalid_url());
    }
}
