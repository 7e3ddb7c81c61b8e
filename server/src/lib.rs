//! VoiceHub Server - Conversation backend for voice assistants.
//!
//! This crate provides the server component of VoiceHub, responsible for:
//! - Account management, token-based authentication and API keys
//! - Storing conversations and their turns, with encrypted content
//! - Full-text search across a user's conversations
//! - Issuing LiveKit room tokens for voice sessions
//! - Administration of system prompts and users
//!
//! # Architecture
//!
//! The server is a thin HTTP layer in front of Supabase: PostgREST for data,
//! GoTrue for credentials and Storage for audio and files. Token issuance,
//! revocation and rate limiting live in process memory.

pub mod admin;
pub mod api_keys;
pub mod auth;
pub mod config;
pub mod conversation;
pub mod encryption;
pub mod error;
pub mod jwt;
pub mod rate_limit;
pub mod redact;
pub mod revocation;
pub mod routes;
pub mod search;
pub mod storage;
pub mod supabase;
pub mod types;
pub mod validation;
pub mod voice;
