use std::net::ToSocketAddrs;
use std::path::Path;

use boa_engine::{
    js_string, native_function::NativeFunction, Context, JsResult, JsValue, Source,
};
use log::{info, warn};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::ProxyError;

/// Routing decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Direct,
    UseUpstream,
}

/// Standard PAC helper functions made available to scripts. `dnsResolve` and
/// `myIpAddress` are registered as native functions before this runs.
const PAC_PRELUDE: &str = r#"
function isPlainHostName(host) {
    return host.indexOf(".") === -1;
}
function dnsDomainIs(host, domain) {
    return host.length >= domain.length &&
        host.substring(host.length - domain.length) === domain;
}
function dnsDomainLevels(host) {
    return host.split(".").length - 1;
}
function localHostOrDomainIs(host, hostdom) {
    return host === hostdom || hostdom.indexOf(host + ".") === 0;
}
function shExpMatch(str, shexp) {
    var re = shexp
        .replace(/[.+^${}()|[\]\\]/g, "\\$&")
        .replace(/\*/g, ".*")
        .replace(/\?/g, ".");
    return new RegExp("^" + re + "$").test(str);
}
function isInNet(host, pattern, mask) {
    var ip = /^\d+\.\d+\.\d+\.\d+$/.test(host) ? host : dnsResolve(host);
    if (ip === null) {
        return false;
    }
    function addr(a) {
        var p = a.split(".");
        return (((+p[0]) << 24) | ((+p[1]) << 16) | ((+p[2]) << 8) | (+p[3])) >>> 0;
    }
    return ((addr(ip) & addr(mask)) >>> 0) === ((addr(pattern) & addr(mask)) >>> 0);
}
"#;

/// Compiles a PAC script and answers how a URL should be routed.
///
/// The script engine's evaluation contexts are not reentrant, so every call
/// builds a fresh context from the stored source; nothing is shared between
/// workers.
pub struct PacEvaluator {
    source: String,
}

impl PacEvaluator {
    /// Validate that the source evaluates and defines a callable
    /// `FindProxyForURL`. Callers treat failure as "no PAC available", not as
    /// a fatal error.
    pub fn load(source: &str) -> Result<Self, ProxyError> {
        let mut context = Context::default();
        install_prelude(&mut context)
            .map_err(|e| ProxyError::Pac(format!("PAC prelude failed: {e}")))?;
        context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| ProxyError::Pac(format!("script failed to evaluate: {e}")))?;
        let global = context.global_object();
        match global.get(js_string!("FindProxyForURL"), &mut context) {
            Ok(value) if value.is_callable() => {}
            _ => {
                return Err(ProxyError::Pac(
                    "script must define FindProxyForURL".to_string(),
                ))
            }
        }
        Ok(Self {
            source: source.to_string(),
        })
    }

    /// Load a PAC script from disk. Missing, unreadable or unparsable files
    /// log a warning and yield `None`; routing then always uses the upstream.
    pub fn from_file(path: &Path) -> Option<Self> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                warn!("Pac file read failed. {}: {e}", path.display());
                return None;
            }
        };
        match Self::load(&source) {
            Ok(pac) => Some(pac),
            Err(e) => {
                warn!("Pac file {} ignored: {e}", path.display());
                None
            }
        }
    }

    /// Evaluate `FindProxyForURL(url, host)` and map the first `;`-separated
    /// directive: a leading `DIRECT` means direct connection, everything else
    /// (including malformed directives and evaluation errors) conservatively
    /// routes via the upstream proxy.
    pub fn find_route(&self, url: &str, host: &str) -> RouteDecision {
        match self.evaluate(url, host) {
            Ok(result) => {
                let first = result.split(';').next().unwrap_or("").trim();
                if first.starts_with("DIRECT") {
                    info!("Bypass proxy: {url}");
                    RouteDecision::Direct
                } else {
                    RouteDecision::UseUpstream
                }
            }
            Err(e) => {
                warn!("PAC evaluation failed for {url}: {e}");
                RouteDecision::UseUpstream
            }
        }
    }

    fn evaluate(&self, url: &str, host: &str) -> Result<String, ProxyError> {
        let mut context = Context::default();
        install_prelude(&mut context).map_err(|e| ProxyError::Pac(e.to_string()))?;
        context
            .eval(Source::from_bytes(self.source.as_bytes()))
            .map_err(|e| ProxyError::Pac(e.to_string()))?;

        let global = context.global_object();
        let func = global
            .get(js_string!("FindProxyForURL"), &mut context)
            .map_err(|e| ProxyError::Pac(e.to_string()))?;
        let result = func
            .as_callable()
            .ok_or_else(|| ProxyError::Pac("FindProxyForURL is not a function".to_string()))?
            .call(
                &JsValue::undefined(),
                &[
                    JsValue::from(js_string!(url)),
                    JsValue::from(js_string!(host)),
                ],
                &mut context,
            )
            .map_err(|e| ProxyError::Pac(e.to_string()))?;

        match result.as_string() {
            Some(s) => Ok(s.to_std_string_escaped()),
            None => Err(ProxyError::Pac(
                "FindProxyForURL did not return a string".to_string(),
            )),
        }
    }
}

fn install_prelude(context: &mut Context) -> JsResult<()> {
    let global = context.global_object();
    global.set(
        js_string!("dnsResolve"),
        NativeFunction::from_fn_ptr(dns_resolve).to_js_function(context.realm()),
        false,
        context,
    )?;
    global.set(
        js_string!("myIpAddress"),
        NativeFunction::from_fn_ptr(my_ip_address).to_js_function(context.realm()),
        false,
        context,
    )?;
    context.eval(Source::from_bytes(PAC_PRELUDE.as_bytes()))?;
    Ok(())
}

fn dns_resolve(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let Some(host) = args.first().and_then(|v| v.as_string()) else {
        return Ok(JsValue::null());
    };
    let host = host.to_std_string_escaped();
    // The lookup is synchronous; on a multi-threaded runtime, move it off the
    // worker so other tasks scheduled there keep running.
    let resolve = || (host.as_str(), 0u16).to_socket_addrs();
    let resolved = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(resolve)
        }
        _ => resolve(),
    };
    let addrs = match resolved {
        Ok(addrs) => addrs,
        Err(_) => return Ok(JsValue::null()),
    };
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Ok(JsValue::from(js_string!(addr.ip().to_string())));
        }
        fallback.get_or_insert(addr.ip());
    }
    match fallback {
        Some(ip) => Ok(JsValue::from(js_string!(ip.to_string()))),
        None => Ok(JsValue::null()),
    }
}

fn my_ip_address(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(js_string!("127.0.0.1")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ALWAYS_DIRECT: &str = r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#;

    #[test]
    fn direct_directive() {
        let pac = PacEvaluator::load(ALWAYS_DIRECT).unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::Direct
        );
    }

    #[test]
    fn proxy_directive_routes_upstream() {
        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) { return "PROXY proxy.corp:3128"; }"#,
        )
        .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn only_first_directive_counts() {
        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) { return " DIRECT; PROXY fallback:3128"; }"#,
        )
        .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::Direct
        );

        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) { return "PROXY fallback:3128; DIRECT"; }"#,
        )
        .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn malformed_directive_routes_upstream() {
        let pac =
            PacEvaluator::load(r#"function FindProxyForURL(url, host) { return "garbage"; }"#)
                .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn non_string_result_routes_upstream() {
        let pac = PacEvaluator::load(r#"function FindProxyForURL(url, host) { return 42; }"#)
            .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn runtime_error_routes_upstream() {
        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) { throw new Error("boom"); }"#,
        )
        .unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn load_rejects_invalid_source() {
        assert!(PacEvaluator::load("this is (( not javascript").is_err());
    }

    #[test]
    fn load_requires_entry_point() {
        assert!(PacEvaluator::load("function somethingElse() { return 1; }").is_err());
    }

    #[test]
    fn helper_functions() {
        let pac = PacEvaluator::load(
            r#"
            function FindProxyForURL(url, host) {
                if (isPlainHostName(host)) return "DIRECT";
                if (dnsDomainIs(host, ".internal.example")) return "DIRECT";
                if (shExpMatch(host, "*.cdn.example")) return "DIRECT";
                if (isInNet(host, "10.0.0.0", "255.0.0.0")) return "DIRECT";
                return "PROXY upstream:3128";
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            pac.find_route("http://intranet/", "intranet"),
            RouteDecision::Direct
        );
        assert_eq!(
            pac.find_route("http://db.internal.example/", "db.internal.example"),
            RouteDecision::Direct
        );
        assert_eq!(
            pac.find_route("http://a.cdn.example/x", "a.cdn.example"),
            RouteDecision::Direct
        );
        assert_eq!(
            pac.find_route("http://10.1.2.3/", "10.1.2.3"),
            RouteDecision::Direct
        );
        assert_eq!(
            pac.find_route("http://www.example.com/", "www.example.com"),
            RouteDecision::UseUpstream
        );
    }

    #[test]
    fn repeated_calls_are_idempotent() {
        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) {
                return host === "fast.example" ? "DIRECT" : "PROXY upstream:3128";
            }"#,
        )
        .unwrap();
        for _ in 0..3 {
            assert_eq!(
                pac.find_route("http://fast.example/", "fast.example"),
                RouteDecision::Direct
            );
            assert_eq!(
                pac.find_route("http://slow.example/", "slow.example"),
                RouteDecision::UseUpstream
            );
        }
    }

    #[test]
    fn from_file_missing_path_is_none() {
        assert!(PacEvaluator::from_file(Path::new("/nonexistent/proxy.pac")).is_none());
    }

    #[test]
    fn from_file_loads_valid_script() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ALWAYS_DIRECT.as_bytes()).unwrap();
        let pac = PacEvaluator::from_file(file.path()).unwrap();
        assert_eq!(
            pac.find_route("http://example.com/", "example.com"),
            RouteDecision::Direct
        );
    }
}
