//! Per-session startup values: the pvt token and the blocks embedded in the
//! chat page.
//!
//! The chat page carries its configuration as script blocks of the form
//!
//! ```text
//! AF_initDataCallback({key: 'ds:0', data:function(){return [["cin:cac",...]]}});
//! ```
//!
//! Only [`extract_startup_config`] knows about that layout.

use hangish_wire::{MessageSchema, StructuredMessage, WireValue, decode, decode_tagged, parse_array_literal};
use tracing::{debug, info};

use crate::channel::ChannelParams;
use crate::config::StartupConfigUrls;
use crate::context::SessionContext;
use crate::error::StartupError;
use crate::http::{HttpRequest, HttpTransport};
use crate::schemas::{CHAT_API_CONFIGURATION, CHAT_INIT_PARAMETERS, EC_CONFIGURATION, PVT_TOKEN};

pub const MAX_REDIRECTS: usize = 10;

const BLOCK_END: &str = "}});";
/// `cin:acc` is searched from here on; earlier pages repeat the tag.
const INIT_PARAMETERS_ANCHOR: &str = "key: 'ds:2'";
const EC_PARAM: &str = r#"["ci:ec",true,true,false]"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupConfig {
    pub api_key: String,
    pub channel_path: String,
    pub ec_param: String,
    pub prop_param: String,
    pub header_id: String,
    pub header_date: Option<String>,
    pub header_version: Option<String>,
}

impl StartupConfig {
    pub fn channel_params(&self) -> ChannelParams {
        ChannelParams {
            path: self.channel_path.clone(),
            ec_param: self.ec_param.clone(),
            prop_param: self.prop_param.clone(),
            header_client_id: self.header_id.clone(),
        }
    }
}

/// Pull the startup blocks out of the chat page.
///
/// `cin:cac` and `cin:bcsc` are required; an empty API key means the
/// session behind the cookies has expired. `cin:acc` is optional.
pub fn extract_startup_config(page: &str) -> Result<StartupConfig, StartupError> {
    let api = decode_block(page, "cin:cac", &CHAT_API_CONFIGURATION)?
        .ok_or(StartupError::MissingBlock("cin:cac"))?;
    let api_key = api
        .get_str("key")
        .filter(|key| !key.is_empty())
        .ok_or(StartupError::MissingBlock("cin:cac"))?
        .to_string();

    let ec = decode_block(page, "cin:bcsc", &EC_CONFIGURATION)?
        .ok_or(StartupError::MissingBlock("cin:bcsc"))?;
    let field = |name: &'static str| {
        ec.get_str(name)
            .map(str::to_string)
            .ok_or(StartupError::MissingField {
                block: "cin:bcsc",
                field: name,
            })
    };

    let init_page = page
        .find(INIT_PARAMETERS_ANCHOR)
        .map_or(page, |at| &page[at..]);
    let init = decode_block(init_page, "cin:acc", &CHAT_INIT_PARAMETERS)?;
    if init.is_none() {
        debug!("no cin:acc block; request headers go out without date and version");
    }

    Ok(StartupConfig {
        api_key,
        channel_path: field("channel_path")?,
        ec_param: field("ec_param")?,
        prop_param: field("prop_param")?,
        header_id: field("header_id")?,
        header_date: init
            .as_ref()
            .and_then(|m| m.get_str("header_date"))
            .map(str::to_string),
        header_version: init
            .as_ref()
            .and_then(|m| m.get_str("header_version"))
            .map(str::to_string),
    })
}

/// Text from `[["<tag>"` up to the first block terminator after it.
fn find_block<'a>(page: &'a str, tag: &str) -> Option<&'a str> {
    let start = page.find(&format!("[[\"{tag}\""))?;
    let rest = &page[start..];
    let end = rest.find(BLOCK_END)?;
    Some(rest[..end].trim_end())
}

fn decode_block(
    page: &str,
    tag: &'static str,
    schema: &'static MessageSchema,
) -> Result<Option<StructuredMessage>, StartupError> {
    let Some(text) = find_block(page, tag) else {
        return Ok(None);
    };
    let decoded = parse_array_literal(text).and_then(|value| {
        let first = value.get(0).cloned().unwrap_or(WireValue::Null);
        decode_tagged(&first, tag, schema)
    });
    decoded
        .map(Some)
        .map_err(|source| StartupError::Decode { block: tag, source })
}

/// Read the token from an extension-start reply.
pub fn parse_pvt_token(body: &str) -> Result<String, StartupError> {
    let token = parse_array_literal(body)
        .and_then(|value| decode(&value, &PVT_TOKEN))
        .map_err(|e| {
            debug!(error = %e, "unreadable pvt reply");
            StartupError::MissingPvtToken
        })?;
    token
        .get_str("token")
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(StartupError::MissingPvtToken)
}

pub fn pvt_request(urls: &StartupConfigUrls) -> HttpRequest {
    HttpRequest::get(urls.pvt_url.clone())
}

pub fn chat_init_request(urls: &StartupConfigUrls, pvt: &str) -> HttpRequest {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("prop", "hangish")
        .append_pair("fid", "gtn-roster-iframe-id")
        .append_pair("ec", EC_PARAM)
        .append_pair("pvt", pvt)
        .finish();
    HttpRequest::get(format!("{}?{query}", urls.chat_url))
}

/// The pvt token and the names of cookies the reply set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvtReply {
    pub token: String,
    pub updated_cookies: Vec<String>,
}

/// GET extension-start. Every cookie in the reply is taken.
pub async fn fetch_pvt_token<H: HttpTransport>(
    ctx: &SessionContext<H>,
    urls: &StartupConfigUrls,
) -> Result<PvtReply, StartupError> {
    let response = ctx.execute(pvt_request(urls)).await?;
    if response.status != 200 {
        return Err(StartupError::Status(response.status));
    }
    let updated_cookies = ctx.merge(&response.headers);
    let token = parse_pvt_token(&response.text())?;
    debug!(cookies = updated_cookies.len(), "pvt token received");
    Ok(PvtReply {
        token,
        updated_cookies,
    })
}

/// GET the chat page, following redirects, and extract its startup blocks.
pub async fn fetch_startup_config<H: HttpTransport>(
    ctx: &SessionContext<H>,
    urls: &StartupConfigUrls,
    pvt: &str,
) -> Result<StartupConfig, StartupError> {
    let mut request = chat_init_request(urls, pvt);
    for _ in 0..=MAX_REDIRECTS {
        let response = ctx.execute(request).await?;
        ctx.rotate(&response.headers);
        if response.is_redirect() {
            if let Some(target) = response.redirect_target() {
                debug!(%target, "following chat page redirect");
                request = HttpRequest::get(target);
                continue;
            }
        }
        if !response.is_success() {
            return Err(StartupError::Status(response.status));
        }
        let config = extract_startup_config(&response.text())?;
        info!(path = %config.channel_path, "startup configuration loaded");
        return Ok(config);
    }
    Err(StartupError::TooManyRedirects(urls.chat_url.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::{Cookie, CookieStore, SessionCookieSet};
    use crate::testing::{Reply, ScriptedTransport};

    fn page(key: &str) -> String {
        format!(
            concat!(
                "<html><script>AF_initDataCallback({{key: 'ds:0', data:function(){{return ",
                "[[\"cin:cac\",null,\"{key}\"]\n]}}}});</script>\n",
                "<script>AF_initDataCallback({{key: 'ds:1', data:function(){{return ",
                "[[\"cin:bcsc\",null,\"/webchannel/\",null,\"[\\\"ci:ec\\\",true]\",\"hangish\",null,\"HID\"]]}}}});</script>\n",
                "<script>AF_initDataCallback({{key: 'ds:2', data:function(){{return ",
                "[[\"cin:acc\",null,null,null,\"20150601\",null,\"chat_frontend_1\"]]}}}});</script>"
            ),
            key = key
        )
    }

    fn urls() -> StartupConfigUrls {
        StartupConfigUrls {
            pvt_url: "https://chat.example.test/extension-start".into(),
            chat_url: "https://chat.example.test/chat".into(),
        }
    }

    fn ctx(transport: &ScriptedTransport) -> SessionContext<ScriptedTransport> {
        let set: SessionCookieSet = [Cookie::new("SID", "1")].into_iter().collect();
        SessionContext::new(transport.clone(), CookieStore::new(set), "test")
    }

    #[test]
    fn extracts_all_blocks() {
        let config = extract_startup_config(&page("AIzaKEY")).unwrap();
        assert_eq!(config.api_key, "AIzaKEY");
        assert_eq!(config.channel_path, "/webchannel/");
        assert_eq!(config.ec_param, "[\"ci:ec\",true]");
        assert_eq!(config.prop_param, "hangish");
        assert_eq!(config.header_id, "HID");
        assert_eq!(config.header_date.as_deref(), Some("20150601"));
        assert_eq!(config.header_version.as_deref(), Some("chat_frontend_1"));

        let params = config.channel_params();
        assert_eq!(params.header_client_id, "HID");
        assert_eq!(params.path, "/webchannel/");
    }

    #[test]
    fn empty_api_key_means_stale_session() {
        let err = extract_startup_config(&page("")).unwrap_err();
        assert_eq!(err, StartupError::MissingBlock("cin:cac"));
        assert!(err.is_session_stale());

        let err = extract_startup_config("<html>sign in</html>").unwrap_err();
        assert!(err.is_session_stale());
    }

    #[test]
    fn init_parameters_are_optional() {
        let full = page("K");
        let cut = &full[..full.find("<script>AF_initDataCallback({key: 'ds:2'").unwrap()];
        let config = extract_startup_config(cut).unwrap();
        assert_eq!(config.header_date, None);
    }

    #[test]
    fn malformed_block_names_the_block() {
        let text = page("K").replace("null,\"/webchannel/\"", "null,\"/webchannel/");
        assert!(matches!(
            extract_startup_config(&text),
            Err(StartupError::Decode { block: "cin:bcsc", .. })
        ));
    }

    #[test]
    fn pvt_token_parsing() {
        assert_eq!(parse_pvt_token(r#"["tok-1",1,2]"#).unwrap(), "tok-1");
        assert_eq!(parse_pvt_token("[]"), Err(StartupError::MissingPvtToken));
        assert_eq!(parse_pvt_token("<html>"), Err(StartupError::MissingPvtToken));
    }

    #[test]
    fn chat_init_query() {
        let req = chat_init_request(&urls(), "p v");
        assert!(req.url.starts_with(
            "https://chat.example.test/chat?prop=hangish&fid=gtn-roster-iframe-id&ec="
        ));
        assert!(req.url.ends_with("&pvt=p+v"));
    }

    #[tokio::test]
    async fn pvt_fetch_takes_all_cookies() {
        let transport = ScriptedTransport::new();
        transport.reply(
            "GET",
            "extension-start",
            Reply::ok(r#"["tok"]"#)
                .set_cookie("SID=2")
                .set_cookie("NEW=x"),
        );
        let ctx = ctx(&transport);
        let reply = fetch_pvt_token(&ctx, &urls()).await.unwrap();
        assert_eq!(reply.token, "tok");
        assert_eq!(reply.updated_cookies, ["SID", "NEW"]);
        assert_eq!(ctx.cookies().snapshot().value("NEW"), Some("x"));
    }

    #[tokio::test]
    async fn pvt_fetch_rejects_non_200() {
        let transport = ScriptedTransport::new();
        transport.reply("GET", "extension-start", Reply::status(401, ""));
        let err = fetch_pvt_token(&ctx(&transport), &urls()).await.unwrap_err();
        assert_eq!(err, StartupError::Status(401));
        assert!(err.is_session_stale());
    }

    #[tokio::test]
    async fn chat_page_redirects_are_followed() {
        let transport = ScriptedTransport::new();
        transport.reply(
            "GET",
            "/chat?",
            Reply::redirect("/landing").set_cookie("SID=rotated"),
        );
        transport.reply("GET", "/landing", Reply::ok(&page("K")));
        let ctx = ctx(&transport);
        let config = fetch_startup_config(&ctx, &urls(), "pvt").await.unwrap();
        assert_eq!(config.api_key, "K");
        assert_eq!(transport.requests()[1].url, "https://chat.example.test/landing");
        assert_eq!(
            transport.requests()[1].header_value("cookie"),
            Some("SID=rotated")
        );
    }

    #[tokio::test]
    async fn redirect_loops_are_bounded() {
        let transport = ScriptedTransport::new();
        for _ in 0..=MAX_REDIRECTS {
            transport.reply("GET", "/chat", Reply::redirect("/chat"));
        }
        let err = fetch_startup_config(&ctx(&transport), &urls(), "pvt")
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::TooManyRedirects(_)));
    }
}
