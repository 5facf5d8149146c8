//! Gateway: HTTP status surface.
//!
//! Serves health and session status, the pairing QR code, the filter update endpoint and,
//! when the bridge transport is active, the bridge event intake.

mod pairing;
mod server;

pub use pairing::{render_svg, svg_data_url};
pub use server::{router, BridgeIntake, GatewayState};
