//! Human-facing HTML pages.
//!
//! The pairing code is embedded as text; the browser renders it as a QR image.

use axum::{extract::State, response::Html};

use relay_core::connection::ConnectionState;

use crate::router::AppState;

const QR_SCRIPT_URL: &str = "https://cdnjs.cloudflare.com/ajax/libs/qrcodejs/1.0.0/qrcode.min.js";

/// Seconds before the pairing page reloads to pick up a rotated code.
const QR_REFRESH_SECS: u32 = 45;

const BODY_STYLE: &str = "font-family: Arial, sans-serif; text-align: center; padding: 50px;";

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
  </head>
  <body style="{BODY_STYLE}">
{body}
  </body>
</html>
"#,
        title = escape_html(title),
    ))
}

/// GET /qr
pub async fn qr(State(state): State<AppState>) -> Html<String> {
    render_qr(&state.connection.current_state())
}

fn render_qr(current: &ConnectionState) -> Html<String> {
    match current {
        ConnectionState::AwaitingPairing(code) => page(
            "WhatsApp Bot - Scan QR Code",
            &format!(
                r#"    <h1 style="color: #25D366;">📱 Scan QR Code with WhatsApp</h1>
    <p><strong>Step 1:</strong> Open WhatsApp on your phone</p>
    <p><strong>Step 2:</strong> Go to <strong>Settings → Linked Devices → Link a Device</strong></p>
    <p><strong>Step 3:</strong> Scan this QR code:</p>
    <div id="qr" data-code="{code}" style="display: inline-block; margin: 30px auto; padding: 20px; border: 3px solid #25D366; border-radius: 10px;"></div>
    <p><button onclick="location.reload()">🔄 Refresh QR Code</button></p>
    <p style="color: #666; font-size: 14px;">QR code will auto-refresh in {QR_REFRESH_SECS} seconds</p>
    <script src="{QR_SCRIPT_URL}"></script>
    <script>
      var el = document.getElementById("qr");
      new QRCode(el, {{ text: el.dataset.code, width: 300, height: 300 }});
      setTimeout(function () {{ location.reload(); }}, {refresh_ms});
    </script>"#,
                code = escape_html(code.as_str()),
                refresh_ms = QR_REFRESH_SECS * 1000,
            ),
        ),
        ConnectionState::Ready => page(
            "WhatsApp Bot - Connected",
            r#"    <h1>✅ WhatsApp Bot Connected!</h1>
    <p>Your WhatsApp bot is ready and connected.</p>
    <p><a href="/health">Check Status</a></p>"#,
        ),
        ConnectionState::Disconnected(reason) => page(
            "WhatsApp Bot - Disconnected",
            &format!(
                r#"    <h1>⚠️ WhatsApp Bot Disconnected</h1>
    <p>{reason}</p>
    <p>Restart the service to pair again.</p>"#,
                reason = escape_html(&reason.to_string()),
            ),
        ),
        ConnectionState::Uninitialized | ConnectionState::Authenticated => page(
            "WhatsApp Bot - Loading",
            &format!(
                r#"    <h1>🔄 Loading...</h1>
    <p>WhatsApp client is initializing. Please wait...</p>
    <p><button onclick="location.reload()">Refresh</button></p>
    <p><strong>State:</strong> {}</p>"#,
                current.label()
            ),
        ),
    }
}

/// GET /
pub async fn home(State(state): State<AppState>) -> Html<String> {
    let status = if state.connection.is_ready() {
        "✅ Connected"
    } else {
        "🔄 Not Connected"
    };
    page(
        "WhatsApp Booking Relay",
        &format!(
            r#"    <h1>🤖 WhatsApp Booking Relay</h1>
    <p>Sends a WhatsApp confirmation for every booking email.</p>
    <p>
      <a href="/qr">📱 Connect WhatsApp</a> |
      <a href="/health">📊 Check Status</a>
    </p>
    <p><strong>Status:</strong> {status}</p>"#
        ),
    )
}
