//! HTML pages for spawn errors

use super::error::SpawnError;
use crate::journey::StepState;

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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

const STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
pre{background:#f4f4f4;padding:1em;overflow:auto}\
table{border-collapse:collapse}td,th{border:1px solid #ccc;padding:.3em .6em;text-align:left}\
.errored{background:#fdd}.performed{color:#282}";

/// Full diagnostic page: summary, details, output, environment dump and journey
pub fn render_friendly(err: &SpawnError, app_name: &str) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    html.push_str("<title>Web application could not be started</title>");
    html.push_str(&format!("<style>{}</style></head><body>\n", STYLE));
    html.push_str(&format!(
        "<h1>Web application could not be started</h1>\n<p>Application: <code>{}</code></p>\n",
        html_escape(app_name)
    ));
    html.push_str(&format!("<h2>{}</h2>\n", html_escape(&err.summary)));
    html.push_str(&format!(
        "<p>Error ID: <code>{}</code> &middot; Category: <code>{}</code></p>\n",
        html_escape(&err.id),
        err.category
    ));

    if let Some(details) = &err.details {
        html.push_str(&format!("<h3>Details</h3>\n<pre>{}</pre>\n", html_escape(details)));
    }

    html.push_str("<h3>Spawn journey</h3>\n<table><tr><th>Step</th><th>State</th><th>Duration</th></tr>\n");
    for (step, info) in err.journey.steps() {
        let class = match info.state {
            StepState::Errored => " class=\"errored\"",
            StepState::Performed => " class=\"performed\"",
            _ => "",
        };
        let duration = info
            .duration()
            .map(|d| format!("{} ms", d.as_millis()))
            .unwrap_or_default();
        html.push_str(&format!(
            "<tr{}><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            class,
            step.as_str(),
            info.state.as_str(),
            duration
        ));
    }
    html.push_str("</table>\n");

    if !err.stdout_and_err.is_empty() {
        html.push_str(&format!(
            "<h3>Application output</h3>\n<pre>{}</pre>\n",
            html_escape(&err.stdout_and_err)
        ));
    }
    for (title, content) in [
        ("Environment variables", &err.envdump.envvars),
        ("User information", &err.envdump.user_info),
        ("Resource limits", &err.envdump.ulimits),
    ] {
        if let Some(content) = content {
            html.push_str(&format!("<h3>{}</h3>\n<pre>{}</pre>\n", title, html_escape(content)));
        }
    }

    html.push_str("</body></html>\n");
    html
}

/// Page shown when friendly error pages are off; only the id leaks out
pub fn render_terse(err: &SpawnError) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Internal Server Error</title>\
<style>{}</style></head><body>\n<h1>Internal Server Error</h1>\n\
<p>The web application could not be started. Please check the server log for details.</p>\n\
<p>Error ID: <code>{}</code></p>\n</body></html>\n",
        STYLE,
        html_escape(&err.id)
    )
}
