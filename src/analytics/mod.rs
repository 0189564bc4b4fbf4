/**
 * ============================================================================
 * ANALYTICS MODULE
 * ============================================================================
 *
 * PURPOSE: Client-side state, validation, and wire formatting for the
 * GA4 Measurement Protocol.
 *
 * ARCHITECTURE:
 * - types: Parameter values, protocol variants, violations, errors
 * - config: Configuration schema, persistence, endpoint URL
 * - storage: Durable key-value settings (trait + implementations)
 * - validation: Name/length/count rules and the diagnostics policy
 * - payload: JSON payload construction for one event
 * - state: Snapshot-based client state with write-through persistence
 * - transport: HTTP delivery (trait + reqwest implementation)
 * - client: High-level orchestration (merge, validate, serialize, send)
 *
 * AUTHOR: Measurement Protocol Client Team
 * CREATED: 2026-10-16
 * ============================================================================
 */

pub mod types;
pub mod config;
pub mod storage;
pub mod validation;
pub mod payload;
pub mod state;
pub mod transport;
pub mod client;
