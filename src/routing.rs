//! Maps inbound requests to the admin endpoint or a service backend

use hyper::Request;

use crate::config::{Configuration, ForwardRule, SourceUrl};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Served by the admin endpoint; `path` is the remainder below the rule prefix
    Admin { path: String },

    /// Forwarded to `destination`, a full backend URL
    Forward { service: String, destination: String },
}

/// Immutable snapshot of the routing rules, rebuilt whenever the
/// configuration changes
#[derive(Debug, Default)]
pub struct RouteTable {
    admin: Vec<SourceUrl>,
    forwards: Vec<(String, ForwardRule)>,
}

impl RouteTable {
    pub fn from_config(config: &Configuration) -> Self {
        let forwards = config
            .services
            .iter()
            .flat_map(|service| {
                service
                    .forward_rules
                    .iter()
                    .map(move |rule| (service.name.clone(), rule.clone()))
            })
            .collect();

        Self {
            admin: config.admin.rules.clone(),
            forwards,
        }
    }

    pub fn len(&self) -> usize {
        self.admin.len() + self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First match wins: admin rules, then forward rules in service order
    pub fn resolve(
        &self,
        secure: bool,
        host: Option<&str>,
        path: &str,
        query: Option<&str>,
    ) -> Option<Route> {
        let scheme = if secure { "https" } else { "http" };

        for rule in &self.admin {
            if let Some(rest) = rule.matches(scheme, host, path) {
                let path = if rest.is_empty() { "/" } else { rest };
                return Some(Route::Admin {
                    path: path.to_string(),
                });
            }
        }

        for (service, rule) in &self.forwards {
            if let Some(rest) = rule.from.matches(scheme, host, path) {
                return Some(Route::Forward {
                    service: service.clone(),
                    destination: join_destination(&rule.to, rest, query),
                });
            }
        }

        None
    }
}

impl SourceUrl {
    /// Returns the path remainder below `self.path` when the request matches
    pub fn matches<'a>(&self, scheme: &str, host: Option<&str>, path: &'a str) -> Option<&'a str> {
        if !self.scheme.is_empty() && !self.scheme.eq_ignore_ascii_case(scheme) {
            return None;
        }

        if !self.hostname.is_empty() {
            let host = host?;
            if !strip_port(&self.hostname).eq_ignore_ascii_case(strip_port(host)) {
                return None;
            }
        }

        let prefix = self.path.trim_end_matches('/');
        if prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(prefix)?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

fn join_destination(to: &str, rest: &str, query: Option<&str>) -> String {
    let mut destination = if rest.is_empty() {
        to.to_string()
    } else {
        format!("{}{}", to.trim_end_matches('/'), rest)
    };
    if let Some(query) = query {
        destination.push('?');
        destination.push_str(query);
    }
    destination
}

/// Requested hostname, from the Host header or, for HTTP/2, the URI authority
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = strip_port(raw);
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '[' | ']' | ':'))
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Service;

    fn source(scheme: &str, hostname: &str, path: &str) -> SourceUrl {
        SourceUrl {
            scheme: scheme.to_string(),
            hostname: hostname.to_string(),
            path: path.to_string(),
        }
    }

    fn table() -> RouteTable {
        let mut config = Configuration::default();
        config.admin.rules.push(source("", "admin.example.com", "/"));
        config.admin.rules.push(source("https", "", "/goule"));
        config.services.push(Service {
            name: "blog".to_string(),
            forward_rules: vec![
                ForwardRule {
                    from: source("", "example.com", "/blog"),
                    to: "http://127.0.0.1:8080/".to_string(),
                },
                ForwardRule {
                    from: source("", "example.com", "/"),
                    to: "http://127.0.0.1:9090/site".to_string(),
                },
            ],
            executables: Vec::new(),
        });
        RouteTable::from_config(&config)
    }

    #[test]
    fn test_source_matching() {
        let rule = source("", "Example.com", "/blog/");
        assert_eq!(rule.matches("http", Some("example.com:8080"), "/blog"), Some(""));
        assert_eq!(rule.matches("https", Some("EXAMPLE.COM"), "/blog/a/b"), Some("/a/b"));
        assert_eq!(rule.matches("http", Some("example.com"), "/blogs"), None);
        assert_eq!(rule.matches("http", Some("other.com"), "/blog"), None);
        assert_eq!(rule.matches("http", None, "/blog"), None);

        let any = source("", "", "/");
        assert_eq!(any.matches("http", None, "/x"), Some("/x"));

        let tls_only = source("https", "", "/");
        assert_eq!(tls_only.matches("http", None, "/"), None);
    }

    #[test]
    fn test_admin_rules_take_precedence() {
        let table = table();
        assert_eq!(
            table.resolve(false, Some("admin.example.com"), "/api/Config", None),
            Some(Route::Admin {
                path: "/api/Config".to_string()
            })
        );
        assert_eq!(
            table.resolve(true, Some("example.com"), "/goule", None),
            Some(Route::Admin {
                path: "/".to_string()
            })
        );
        // Without TLS the second admin rule does not apply.
        assert!(matches!(
            table.resolve(false, Some("example.com"), "/goule", None),
            Some(Route::Forward { .. })
        ));
    }

    #[test]
    fn test_forward_destination() {
        let table = table();
        assert_eq!(
            table.resolve(false, Some("example.com"), "/blog/post/1", Some("a=1")),
            Some(Route::Forward {
                service: "blog".to_string(),
                destination: "http://127.0.0.1:8080/post/1?a=1".to_string(),
            })
        );
        assert_eq!(
            table.resolve(false, Some("example.com"), "/blog", None),
            Some(Route::Forward {
                service: "blog".to_string(),
                destination: "http://127.0.0.1:8080/".to_string(),
            })
        );
        assert_eq!(
            table.resolve(false, Some("example.com"), "/about", None),
            Some(Route::Forward {
                service: "blog".to_string(),
                destination: "http://127.0.0.1:9090/site/about".to_string(),
            })
        );
        assert_eq!(table.resolve(false, Some("unknown.org"), "/", None), None);
    }

    #[test]
    fn test_request_host() {
        let req = Request::builder()
            .uri("/")
            .header("Host", "Example.COM:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("example.com".to_string()));

        let h2 = Request::builder()
            .uri("https://h2.example.com/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&h2), Some("h2.example.com".to_string()));

        let bad = Request::builder()
            .uri("/")
            .header("Host", "evil\tname")
            .body(())
            .unwrap();
        assert_eq!(request_host(&bad), None);
    }
}
