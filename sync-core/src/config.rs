/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Tunables for the queue manager, retry executor and repository policy
//! engine. Every field has the default named in the design notes; callers
//! embedding this crate typically only override a handful of these.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    LocalFirst,
    RemoteFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    LocalOnly,
    LocalThenRemote,
    RemoteFirst,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_pending: usize,
    pub admission_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub default_save_policy: SavePolicy,
    pub default_load_policy: LoadPolicy,

    pub foreground: QueueConfig,
    pub load: QueueConfig,
    pub background: QueueConfig,

    /// How often the retry executor wakes up while the app is foregrounded.
    pub foreground_poll_interval: Duration,
    /// How often it wakes up once `set_background_mode(true)` has been called.
    pub background_poll_interval: Duration,

    /// Dead-letter a sync queue entry after this many failed attempts.
    pub max_attempts: u32,

    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_save_policy: SavePolicy::LocalFirst,
            default_load_policy: LoadPolicy::LocalThenRemote,

            foreground: QueueConfig {
                concurrency: 1,
                max_pending: 50,
                admission_timeout: Duration::from_millis(100),
            },
            load: QueueConfig {
                concurrency: 1,
                max_pending: 50,
                admission_timeout: Duration::from_millis(100),
            },
            background: QueueConfig {
                concurrency: 1,
                max_pending: 50,
                admission_timeout: Duration::from_millis(100),
            },

            foreground_poll_interval: Duration::from_secs(5),
            background_poll_interval: Duration::from_secs(60),

            max_attempts: 10,

            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}
