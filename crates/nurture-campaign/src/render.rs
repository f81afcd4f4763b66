//! Template rendering and tracking instrumentation.
//!
//! Both steps are pure: templates are never mutated and the same inputs always
//! produce the same output.

use regex::{Captures, Regex};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use nurture_core::config::TrackingConfig;
use nurture_core::{Lead, NurtureError, Result, Template};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern is valid")
});

static HTTP_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*"(https?://[^"]+)""#).expect("link pattern is valid")
});

/// Subject and bodies with every placeholder resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

pub struct TemplateRenderer {
    fallback_name: String,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new("there")
    }
}

impl TemplateRenderer {
    pub fn new(fallback_name: &str) -> Self {
        Self { fallback_name: fallback_name.to_string() }
    }

    pub fn render(&self, template: &Template, lead: &Lead) -> RenderedEmail {
        self.render_with(template, lead, &BTreeMap::new())
    }

    /// Render with extra variables (e.g. `unsubscribe_url`) that take precedence
    /// over lead fields. Values substituted into HTML are escaped.
    pub fn render_with(
        &self,
        template: &Template,
        lead: &Lead,
        extras: &BTreeMap<String, String>,
    ) -> RenderedEmail {
        RenderedEmail {
            subject: self.substitute(&template.subject, lead, extras, false),
            html: self.substitute(&template.html_body, lead, extras, true),
            text: template
                .text_body
                .as_deref()
                .map(|body| self.substitute(body, lead, extras, false)),
        }
    }

    fn substitute(
        &self,
        input: &str,
        lead: &Lead,
        extras: &BTreeMap<String, String>,
        html: bool,
    ) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures<'_>| {
                let value = self.lookup(&caps[1], lead, extras);
                if html { escape_html(&value) } else { value }
            })
            .into_owned()
    }

    fn lookup(&self, key: &str, lead: &Lead, extras: &BTreeMap<String, String>) -> String {
        if let Some(value) = extras.get(key) {
            return value.clone();
        }
        let name = lead.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        match key {
            "name" | "leadName" | "lead_name" => name.unwrap_or(&self.fallback_name).to_string(),
            "first_name" | "firstName" => name
                .and_then(|n| n.split_whitespace().next())
                .unwrap_or(&self.fallback_name)
                .to_string(),
            "email" | "leadEmail" | "lead_email" => lead.email.clone(),
            other => lead.attributes.get(other).cloned().unwrap_or_default(),
        }
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds public tracking URLs and instruments rendered HTML with them.
#[derive(Debug, Clone)]
pub struct TrackingLinks {
    base: Url,
}

impl TrackingLinks {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url.trim())
            .map_err(|e| NurtureError::Config(format!("invalid tracking base url '{base_url}': {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(NurtureError::Config(format!(
                "tracking base url must be http(s): {base_url}"
            )));
        }
        Ok(Self { base })
    }

    /// `None` when tracking is disabled.
    pub fn from_config(config: &TrackingConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(&config.base_url).map(Some)
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(None);
        url
    }

    pub fn open_url(&self, delivery_id: i64) -> String {
        self.endpoint(&format!("/t/open/{delivery_id}")).to_string()
    }

    pub fn click_url(&self, delivery_id: i64, target: &str) -> String {
        let mut url = self.endpoint(&format!("/t/click/{delivery_id}"));
        url.query_pairs_mut().append_pair("url", target);
        url.to_string()
    }

    pub fn unsubscribe_url(&self, delivery_id: i64) -> String {
        self.endpoint(&format!("/t/unsubscribe/{delivery_id}")).to_string()
    }

    /// Rewrite outbound http(s) links through the click endpoint and add the open pixel.
    /// Links already pointing at the tracking host are left alone.
    pub fn instrument(&self, html: &str, delivery_id: i64) -> String {
        let own_prefix = self.endpoint("/t/").to_string();
        let rewritten = HTTP_LINK.replace_all(html, |caps: &Captures<'_>| {
            let target = &caps[1];
            if target.starts_with(&own_prefix) {
                caps[0].to_string()
            } else {
                // href values are HTML-escaped; the redirect target is the raw URL
                let target = target.replace("&amp;", "&");
                format!("href=\"{}\"", self.click_url(delivery_id, &target))
            }
        });

        let pixel = format!(
            "<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none\" />",
            self.open_url(delivery_id)
        );
        match rewritten.to_ascii_lowercase().rfind("</body>") {
            Some(at) => format!("{}{pixel}{}", &rewritten[..at], &rewritten[at..]),
            None => format!("{rewritten}{pixel}"),
        }
    }
}
