//! Track acquisition for a music delivery bot.
//!
//! Resolves tracks through an upstream metadata API and turns them into
//! playable, tagged local files:
//!
//! * [`pipeline`] downloads, decrypts ([`decrypt`]), repairs ([`repair`])
//!   and tags ([`tagger`]) single tracks
//! * [`batch`] acquires playlists into one archive
//! * [`cache`] and [`token`] serve the delivery layer: deduplication of
//!   uploaded content, and short tokens for long URLs
//!
//! External tools (`ffmpeg`, `vorbiscomment` and a cover encoder) are run
//! through [`tool::CommandRunner`] and network access goes through
//! [`http::Transport`], so both can be replaced.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod cover;
pub mod decrypt;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod protocol;
pub mod repair;
pub mod scratch;
pub mod secrets;
pub mod signal;
pub mod tagger;
pub mod token;
pub mod tool;
pub mod track;
