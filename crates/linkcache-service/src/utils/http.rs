use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect;
use thiserror::Error;
use url::{Host, Url};

use crate::config::Config;

/// Upstream sites tend to localize their responses based on the client IP, so we ask for
/// English explicitly.
const ACCEPT_LANGUAGE: &str = "en-US, en;q=0.9, *;q=0.5";

/// The number of redirects followed before giving up, same as reqwest's default policy.
const MAX_REDIRECTS: usize = 10;

static RESERVED_IP_BLOCKS: LazyLock<Vec<Ipv4Network>> = LazyLock::new(|| {
    [
        // https://en.wikipedia.org/wiki/Reserved_IP_addresses#IPv4
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/29",
        "192.0.2.0/24",
        "192.88.99.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .into_iter()
    .map(|x| x.parse().unwrap())
    .collect()
});

/// Returns `true` if `ip` is a public IPv4 address.
///
/// IPv6 addresses are never considered external: we have no list of internal IPv6 services.
pub fn is_external_ip(ip: IpAddr) -> bool {
    let IpAddr::V4(addr) = ip else {
        return false;
    };

    for network in &*RESERVED_IP_BLOCKS {
        if network.contains(addr) {
            metric!(counter("http.blocked_ip") += 1);
            tracing::debug!("Blocked attempt to connect to reserved IP address: {}", addr);
            return false;
        }
    }

    true
}

/// Why the host of an upstream URL can not be connected to.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("url has no host")]
    MissingHost,
    #[error("no such host: {0}")]
    NoSuchHost(String),
    #[error("host only resolves to reserved addresses: {0}")]
    Reserved(String),
}

/// Resolves the host of `url` ahead of the actual request.
///
/// This separates "the host does not exist" from other transport errors, and rejects hosts that
/// only resolve to reserved IP addresses unless `allow_reserved` is set.
///
/// This only looks at the first URL. The client built by [`create_client`] filters reserved
/// addresses again when connecting, which covers redirects and hosts that resolve differently
/// the second time.
pub async fn check_host(url: &Url, allow_reserved: bool) -> Result<(), HostError> {
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<IpAddr> = match url.host() {
        None => return Err(HostError::MissingHost),
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(domain)) => match tokio::net::lookup_host((domain, port)).await {
            Ok(addrs) => addrs.map(|addr: SocketAddr| addr.ip()).collect(),
            Err(_) => return Err(HostError::NoSuchHost(domain.to_owned())),
        },
    };

    if addrs.is_empty() {
        return Err(HostError::NoSuchHost(url.host_str().unwrap_or_default().into()));
    }
    if !allow_reserved && !addrs.into_iter().any(is_external_ip) {
        return Err(HostError::Reserved(url.host_str().unwrap_or_default().into()));
    }

    Ok(())
}

/// Returns `true` if the host of `url` is an IP address literal in a reserved block.
///
/// Such hosts are connected to without consulting the DNS resolver.
fn is_reserved_ip_literal(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => !is_external_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => !is_external_ip(IpAddr::V6(ip)),
        _ => false,
    }
}

/// Resolves `host`, leaving out reserved addresses.
async fn resolve_external(host: String) -> Result<Addrs, Box<dyn Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| is_external_ip(addr.ip()))
        .collect();

    if addrs.is_empty() {
        return Err(HostError::Reserved(host).into());
    }

    Ok(Box::new(addrs.into_iter()))
}

/// A DNS resolver that drops reserved addresses, and fails if nothing else is left.
#[derive(Debug)]
struct ExternalIpResolver;

impl Resolve for ExternalIpResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_external(name.as_str().to_owned()))
    }
}

/// Follows redirects, except to reserved IP address literals.
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if is_reserved_ip_literal(attempt.url()) {
            let host = attempt.url().host_str().unwrap_or_default().to_owned();
            attempt.error(HostError::Reserved(host))
        } else {
            attempt.follow()
        }
    })
}

/// Returns `true` if `err` was caused by a host that may not be connected to.
pub fn is_reserved_host_error(err: &reqwest::Error) -> bool {
    std::iter::successors(Some(err as &(dyn Error + 'static)), |&err| err.source()).any(|err| {
        matches!(
            err.downcast_ref::<HostError>(),
            Some(HostError::Reserved(_))
        )
    })
}

/// Creates the [`reqwest::Client`] shared by all upstream requests.
///
/// Every request carries the configured `User-Agent` and an English `Accept-Language`.
///
/// Unless `connect_to_reserved_ips` is set, the client never connects to a reserved IP address,
/// neither for the requested URL's host nor for any redirect. Such requests fail with an error
/// recognized by [`is_reserved_host_error`]. IP address literals in the requested URL itself are
/// not checked here; see [`check_host`].
pub fn create_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(ACCEPT_LANGUAGE),
    );

    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.max_download_timeout)
        .pool_idle_timeout(Duration::from_secs(30));

    if !config.connect_to_reserved_ips {
        builder = builder
            .dns_resolver(Arc::new(ExternalIpResolver))
            .redirect(redirect_policy());
    }

    Ok(builder.build()?)
}

/// Escapes `text` so it can be embedded into an HTML document verbatim.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '\'' => escaped.push_str("&#39;"),
            '"' => escaped.push_str("&#34;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ips() {
        assert!(!is_external_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_external_ip("10.1.2.3".parse().unwrap()));
        assert!(!is_external_ip("192.168.0.17".parse().unwrap()));
        assert!(!is_external_ip("::1".parse().unwrap()));
        assert!(is_external_ip("1.1.1.1".parse().unwrap()));
        assert!(is_external_ip("93.184.216.34".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_check_host_literal_ips() {
        let url = Url::parse("http://127.0.0.1:8080/image.png").unwrap();
        assert!(matches!(
            check_host(&url, false).await,
            Err(HostError::Reserved(_))
        ));
        assert!(check_host(&url, true).await.is_ok());

        let url = Url::parse("http://1.1.1.1/image.png").unwrap();
        assert!(check_host(&url, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_host_unresolvable() {
        // `.invalid` is reserved and guaranteed to never resolve.
        let url = Url::parse("http://bad.host.invalid/").unwrap();
        assert!(matches!(
            check_host(&url, true).await,
            Err(HostError::NoSuchHost(_))
        ));
    }

    #[tokio::test]
    async fn test_check_host_missing() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(matches!(
            check_host(&url, true).await,
            Err(HostError::MissingHost)
        ));
    }

    #[tokio::test]
    async fn test_resolver_drops_reserved_addresses() {
        let err = ExternalIpResolver
            .resolve("localhost".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<HostError>(),
            Some(HostError::Reserved(host)) if host == "localhost"
        ));
    }

    #[test]
    fn test_reserved_ip_literals() {
        let reserved = |url: &str| is_reserved_ip_literal(&Url::parse(url).unwrap());

        assert!(reserved("http://127.0.0.1:8080/a.png"));
        assert!(reserved("http://169.254.169.254/latest/meta-data/"));
        assert!(reserved("http://[::1]/a.png"));
        assert!(!reserved("http://1.1.1.1/a.png"));
        // Domains are left to the resolver.
        assert!(!reserved("http://localhost/a.png"));
    }

    #[tokio::test]
    async fn test_client_blocks_reserved_hosts() {
        linkcache_test::setup();
        let server = linkcache_test::HitCounter::new();
        let client = create_client(&Config::default()).unwrap();

        let url = server.url("image/png/8/8/a.png");
        assert_eq!(url.host_str(), Some("localhost"));
        let err = client.get(url).send().await.unwrap_err();
        assert!(is_reserved_host_error(&err));
        assert_eq!(server.accesses(), 0);
    }

    #[tokio::test]
    async fn test_client_blocks_redirects_to_reserved_hosts() {
        linkcache_test::setup();
        let server = linkcache_test::HitCounter::new();
        let client = create_client(&Config::default()).unwrap();
        let url = |path: &str| {
            let mut url = server.url(path);
            url.set_host(Some("127.0.0.1")).unwrap();
            url
        };
        let port = url("").port().unwrap();

        // The client does not check IP literals in the requested URL itself, so the fixture is
        // reachable as `127.0.0.1`. Both redirect targets point back at it.
        for host in ["127.0.0.1", "localhost"] {
            let path = format!("redirect/{host}/{port}/image/png/8/8/a.png");
            let err = client.get(url(&path)).send().await.unwrap_err();
            assert!(is_reserved_host_error(&err), "{host}: {err:?}");
            // Only the redirect itself was served.
            assert_eq!(server.accesses(), 1);
        }

        let allowed = create_client(&Config {
            connect_to_reserved_ips: true,
            ..Config::default()
        })
        .unwrap();
        let path = format!("redirect/127.0.0.1/{port}/image/png/8/8/a.png");
        let response = allowed.get(url(&path)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_reserved() {
        let client = create_client(&Config::default()).unwrap();
        let port = linkcache_test::unused_port();
        let err = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap_err();
        assert!(!is_reserved_host_error(&err));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"error <script>alert("x & y")</script>"#),
            "error &lt;script&gt;alert(&#34;x &amp; y&#34;)&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }
}
