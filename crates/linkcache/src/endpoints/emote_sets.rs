use axum::Json;
use axum::extract;
use linkcache_service::emotes::EmoteSet;
use linkcache_service::services::SharedServices;

/// Answers with the emote set, or `null` if there is no set with that ID.
pub async fn handle_emote_set_request(
    extract::State(services): extract::State<SharedServices>,
    extract::Path(set_id): extract::Path<String>,
) -> Json<Option<EmoteSet>> {
    Json(services.emote_sets.get(&set_id))
}

#[cfg(test)]
mod tests {
    use crate::test;

    #[tokio::test]
    async fn test_emote_set() {
        linkcache_test::setup();
        let (server, _upstream) = test::server().await;

        let response = reqwest::get(server.url("twitchemotes/set/488737/"))
            .await
            .unwrap();
        assert!(response.status().is_success());
        insta::assert_snapshot!(
            response.text().await.unwrap(),
            @r#"{"channel_name":"forsen","channel_id":"22484632","type":"sub","custom":false}"#
        );
    }

    #[tokio::test]
    async fn test_custom_emote_set() {
        linkcache_test::setup();
        let (server, _upstream) = test::server().await;

        let response = reqwest::get(server.url("twitchemotes/set/13985/"))
            .await
            .unwrap();
        insta::assert_snapshot!(
            response.text().await.unwrap(),
            @r#"{"channel_name":"evohistorical2015","channel_id":"129284508","type":"sub","custom":true}"#
        );
    }

    #[tokio::test]
    async fn test_missing_emote_set() {
        linkcache_test::setup();
        let (server, _upstream) = test::server().await;

        let response = reqwest::get(server.url("twitchemotes/set/123456789/"))
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "null");
    }
}
