//! nginx site configuration rendering
//!
//! Rendering is a pure function of the domain name, its subfolder and the
//! TLS mode. Both modes share the forwarding body byte for byte; only the
//! listener clause changes.

use std::path::{Path, PathBuf};

/// Listener variant emitted for a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Port 80 only
    Plain,
    /// Port 80 redirecting to a TLS listener backed by the domain's certificate
    Tls,
}

impl TlsMode {
    pub fn from_enabled(ssl_enabled: bool) -> Self {
        if ssl_enabled {
            Self::Tls
        } else {
            Self::Plain
        }
    }
}

/// HTML attributes whose root-absolute values get pointed at the upstream
const REWRITTEN_ATTRIBUTES: [&str; 4] = ["href", "src", "action", "content"];

/// Renders site configs for one fixed upstream
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    upstream: String,
    certificates_path: PathBuf,
}

impl ConfigRenderer {
    /// `upstream` is a `host:port` authority
    pub fn new(upstream: impl Into<String>, certificates_path: impl AsRef<Path>) -> Self {
        Self {
            upstream: upstream.into(),
            certificates_path: certificates_path.as_ref().to_path_buf(),
        }
    }

    pub fn render(&self, name: &str, subfolder: &str, mode: TlsMode) -> String {
        let mut out = String::new();
        out.push_str("server {\n");
        out.push_str(&self.listener(name, mode));
        out.push_str(&format!("    server_name {};\n", name));
        out.push('\n');
        out.push_str(&self.body(subfolder));
        out.push_str("}\n");
        out
    }

    fn listener(&self, name: &str, mode: TlsMode) -> String {
        match mode {
            TlsMode::Plain => "    listen 80;\n".to_string(),
            TlsMode::Tls => {
                let live = self.certificates_path.join(name);
                let certificate = format!("ssl_certificate {};", live.join("fullchain.pem").display());
                let key = format!("ssl_certificate_key {};", live.join("privkey.pem").display());
                // Plain HTTP is sent to HTTPS, as certbot --redirect does
                [
                    "listen 80;",
                    "listen 443 ssl;",
                    certificate.as_str(),
                    key.as_str(),
                    "",
                    "if ($scheme = http) {",
                    "    return 301 https://$host$request_uri;",
                    "}",
                ]
                .iter()
                .map(|line| match *line {
                    "" => "\n".to_string(),
                    line => format!("    {}\n", line),
                })
                .collect()
            }
        }
    }

    fn body(&self, subfolder: &str) -> String {
        let upstream = &self.upstream;
        let mut out = String::new();

        out.push_str("    # Build assets keep their request path\n");
        out.push_str("    location ~ ^/_next/ {\n");
        out.push_str(&format!("        proxy_pass http://{}$request_uri;\n", upstream));
        out.push_str(&self.forward_headers());
        out.push_str("    }\n\n");

        out.push_str("    # Static assets keep their request path\n");
        out.push_str("    location ~ ^/(static|public)/ {\n");
        out.push_str(&format!("        proxy_pass http://{}$request_uri;\n", upstream));
        out.push_str(&self.forward_headers());
        out.push_str("    }\n\n");

        out.push_str("    # Everything else is served from the subfolder\n");
        out.push_str("    location / {\n");
        out.push_str(&format!("        proxy_pass http://{}/{};\n", upstream, subfolder));
        out.push_str(&self.forward_headers());
        out.push('\n');
        out.push_str("        sub_filter_once off;\n");
        for attr in REWRITTEN_ATTRIBUTES {
            out.push_str(&format!(
                "        sub_filter '{attr}=\"/' '{attr}=\"http://{upstream}/';\n",
                attr = attr,
                upstream = upstream
            ));
        }
        out.push_str("    }\n");

        out
    }

    fn forward_headers(&self) -> String {
        let host = format!("proxy_set_header Host {};", self.upstream);
        [
            host.as_str(),
            "proxy_set_header X-Real-IP $remote_addr;",
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
            "proxy_set_header X-Forwarded-Proto $scheme;",
            "proxy_ssl_server_name on;",
        ]
        .iter()
        .map(|line| format!("        {}\n", line))
        .collect()
    }
}
