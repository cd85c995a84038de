//! Crossplay - Bedrock to Java protocol proxy
//!
//! Accepts Bedrock Edition clients, completes their login handshake and
//! resource pack download, then bridges each one to a Java Edition backend.

// ============================================
// Ambient
// ============================================

/// Proxy configuration (YAML)
pub mod config;
/// Localised disconnect and form texts
pub mod lang;

// ============================================
// Wire
// ============================================

/// Frame I/O, compression and transport encryption
pub mod network;
/// Packet models for both legs and the version registry
pub mod protocol;

// ============================================
// Proxy
// ============================================

/// Resource pack loading
pub mod packs;
/// Per-client session bridge
pub mod bridge;
/// Listener and shared proxy state
pub mod server;
