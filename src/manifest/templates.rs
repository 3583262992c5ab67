use super::ManifestParams;

/// Substitutes the fixed set of placeholder tokens the template files carry,
/// grounded on `examples/original_source/mel/yamls.go`'s `REPLACE_*` tokens.
/// Tokens are literal strings, not patterns, so plain `str::replace` is the
/// idiomatic choice here (the original used `regexp.MustCompile` only
/// because Go's stdlib has no simpler literal-replace-all for byte slices
/// read from a file).
pub fn substitute(raw: &str, params: &ManifestParams) -> String {
    let mut out = raw.to_string();
    if let Some(t) = params.tenant {
        out = out.replace("REPLACE_NAMESPACE", t);
    }
    if let Some(p) = params.pod {
        out = out.replace("REPLACE_POD_NAME", p);
    }
    if let Some(h) = params.host {
        out = out.replace("REPLACE_HOST_NAME", h);
    }
    if let Some(g) = params.gateway {
        out = out.replace("REPLACE_GW", g);
        let svc = g.replace('.', "-");
        out = out.replace("REPLACE_SVC_NAME", &svc);
    }
    if let Some(i) = params.image {
        out = out.replace("REPLACE_IMAGE", i);
    }
    if let Some(c) = params.cluster {
        out = out.replace("REPLACE_CLUSTER", c);
    }
    if let Some(w) = params.wan_ip {
        out = out.replace("REPLACE_SELF_NODE_IP", w);
    }
    if let Some(s) = params.storage_class {
        out = out.replace("REPLACE_STORAGE_CLASS", s);
    }
    if let Some(m) = params.mongo_uri {
        out = out.replace("REPLACE_MONGO", m);
    }
    if let Some(a) = params.agent {
        out = out.replace("REPLACE_AGENT_NAME", a);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replaces_only_present_tokens() {
        let raw = "ns=REPLACE_NAMESPACE pod=REPLACE_POD_NAME untouched=REPLACE_IMAGE";
        let params = ManifestParams {
            tenant: Some("acme"),
            pod: Some("apod1"),
            ..Default::default()
        };
        let out = substitute(raw, &params);
        assert_eq!(out, "ns=acme pod=apod1 untouched=REPLACE_IMAGE");
    }

    #[test]
    fn gateway_also_fills_sanitized_service_name() {
        let raw = "gw=REPLACE_GW svc=REPLACE_SVC_NAME";
        let params = ManifestParams {
            gateway: Some("gateway.west.nextensio.net"),
            ..Default::default()
        };
        let out = substitute(raw, &params);
        assert_eq!(out, "gw=gateway.west.nextensio.net svc=gateway-west-nextensio-net");
    }
}
