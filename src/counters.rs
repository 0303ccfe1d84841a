/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::webhdfs::{Event, Operation, Verb};

use std::{
    fmt::Write,
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Per-operation request counters plus the process start mark. Monotone for
/// the process lifetime; mutated only through [`Registry::apply`].
#[derive(Debug)]
pub struct EventTable {
    started: SystemTime,

    get_open: u64,
    get_getfilestatus: u64,
    get_liststatus: u64,
    get_getcontentsummary: u64,
    get_getfilechecksum: u64,
    get_gethomedirectory: u64,
    get_getdelegationtoken: u64,

    put_create: u64,
    put_mkdirs: u64,
    put_rename: u64,
    put_setreplication: u64,
    put_setowner: u64,
    put_setpermission: u64,
    put_settimes: u64,
    put_renewdelegationtoken: u64,
    put_canceldelegationtoken: u64,

    post_append: u64,

    delete_delete: u64,

    get_invalid: u64,
    put_invalid: u64,
    post_invalid: u64,
    delete_invalid: u64,
}

impl EventTable {
    fn new() -> Self {
        Self {
            started: SystemTime::now(),
            get_open: 0,
            get_getfilestatus: 0,
            get_liststatus: 0,
            get_getcontentsummary: 0,
            get_getfilechecksum: 0,
            get_gethomedirectory: 0,
            get_getdelegationtoken: 0,
            put_create: 0,
            put_mkdirs: 0,
            put_rename: 0,
            put_setreplication: 0,
            put_setowner: 0,
            put_setpermission: 0,
            put_settimes: 0,
            put_renewdelegationtoken: 0,
            put_canceldelegationtoken: 0,
            post_append: 0,
            delete_delete: 0,
            get_invalid: 0,
            put_invalid: 0,
            post_invalid: 0,
            delete_invalid: 0,
        }
    }

    fn apply(&mut self, event: Event) {
        let counter = match (event.verb, event.op) {
            (Verb::Get, Some(Operation::Open)) => &mut self.get_open,
            (Verb::Get, Some(Operation::GetFileStatus)) => &mut self.get_getfilestatus,
            (Verb::Get, Some(Operation::ListStatus)) => &mut self.get_liststatus,
            (Verb::Get, Some(Operation::GetContentSummary)) => &mut self.get_getcontentsummary,
            (Verb::Get, Some(Operation::GetFileChecksum)) => &mut self.get_getfilechecksum,
            (Verb::Get, Some(Operation::GetHomeDirectory)) => &mut self.get_gethomedirectory,
            (Verb::Get, Some(Operation::GetDelegationToken)) => &mut self.get_getdelegationtoken,
            (Verb::Put, Some(Operation::Create)) => &mut self.put_create,
            (Verb::Put, Some(Operation::Mkdirs)) => &mut self.put_mkdirs,
            (Verb::Put, Some(Operation::Rename)) => &mut self.put_rename,
            (Verb::Put, Some(Operation::SetReplication)) => &mut self.put_setreplication,
            (Verb::Put, Some(Operation::SetOwner)) => &mut self.put_setowner,
            (Verb::Put, Some(Operation::SetPermission)) => &mut self.put_setpermission,
            (Verb::Put, Some(Operation::SetTimes)) => &mut self.put_settimes,
            (Verb::Put, Some(Operation::RenewDelegationToken)) => &mut self.put_renewdelegationtoken,
            (Verb::Put, Some(Operation::CancelDelegationToken)) => &mut self.put_canceldelegationtoken,
            (Verb::Post, Some(Operation::Append)) => &mut self.post_append,
            (Verb::Delete, Some(Operation::Delete)) => &mut self.delete_delete,
            (Verb::Get, None) => &mut self.get_invalid,
            (Verb::Put, None) => &mut self.put_invalid,
            (Verb::Post, None) => &mut self.post_invalid,
            (Verb::Delete, None) => &mut self.delete_invalid,
            (verb, Some(op)) => {
                tracing::warn!(%verb, ?op, "event does not match any counter");
                return;
            }
        };
        *counter += 1;
    }

    fn get_total(&self) -> u64 {
        self.get_open
            + self.get_getfilestatus
            + self.get_liststatus
            + self.get_getcontentsummary
            + self.get_getfilechecksum
            + self.get_gethomedirectory
            + self.get_getdelegationtoken
            + self.get_invalid
    }

    fn put_total(&self) -> u64 {
        self.put_create
            + self.put_mkdirs
            + self.put_rename
            + self.put_setreplication
            + self.put_setowner
            + self.put_setpermission
            + self.put_settimes
            + self.put_renewdelegationtoken
            + self.put_canceldelegationtoken
            + self.put_invalid
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "webhdfs_get_open {}", self.get_open);
        let _ = writeln!(out, "webhdfs_get_getfilestatus {}", self.get_getfilestatus);
        let _ = writeln!(out, "webhdfs_get_liststatus {}", self.get_liststatus);
        let _ = writeln!(out, "webhdfs_get_getcontentsummary {}", self.get_getcontentsummary);
        let _ = writeln!(out, "webhdfs_get_getfilechecksum {}", self.get_getfilechecksum);
        let _ = writeln!(out, "webhdfs_get_gethomedirectory {}", self.get_gethomedirectory);
        let _ = writeln!(out, "webhdfs_get_getdelegationtoken {}", self.get_getdelegationtoken);
        let _ = writeln!(out, "webhdfs_get_total {}", self.get_total());

        let _ = writeln!(out, "webhdfs_put_create {}", self.put_create);
        let _ = writeln!(out, "webhdfs_put_mkdirs {}", self.put_mkdirs);
        let _ = writeln!(out, "webhdfs_put_rename {}", self.put_rename);
        let _ = writeln!(out, "webhdfs_put_setreplication {}", self.put_setreplication);
        let _ = writeln!(out, "webhdfs_put_setowner {}", self.put_setowner);
        let _ = writeln!(out, "webhdfs_put_setpermission {}", self.put_setpermission);
        let _ = writeln!(out, "webhdfs_put_settimes {}", self.put_settimes);
        let _ = writeln!(out, "webhdfs_put_renewdelegationtoken {}", self.put_renewdelegationtoken);
        let _ = writeln!(out, "webhdfs_put_canceldelegationtoken {}", self.put_canceldelegationtoken);
        let _ = writeln!(out, "webhdfs_put_total {}", self.put_total());

        let _ = writeln!(out, "webhdfs_post_append {}", self.post_append);
        let _ = writeln!(out, "webhdfs_post_total {}", self.post_append + self.post_invalid);

        let _ = writeln!(out, "webhdfs_delete_delete {}", self.delete_delete);
        let _ = writeln!(out, "webhdfs_delete_total {}", self.delete_delete + self.delete_invalid);

        // both stamps derive from one clock sample
        let now = SystemTime::now();
        let start = self.started.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let uptime = now.duration_since(self.started).unwrap_or_default().as_secs();
        let _ = writeln!(out, "proxy_start_timestamp {start}");
        let _ = writeln!(out, "proxy_current_time {}", start + uptime);
        let _ = writeln!(out, "proxy_uptime {uptime}");
        out
    }
}

/// Shared handle around the table: the channel consumer writes, the metrics
/// endpoint renders.
pub struct Registry {
    table: RwLock<EventTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(EventTable::new()),
        }
    }

    pub fn apply(&self, event: Event) {
        self.table.write().unwrap_or_else(|e| e.into_inner()).apply(event);
    }

    pub fn render(&self) -> String {
        self.table.read().unwrap_or_else(|e| e.into_inner()).render()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains the classifier channel for the life of the process. The sole
/// writer of the counter table.
pub async fn consume_events(registry: Arc<Registry>, mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        registry.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(rendered: &str, name: &str) -> u64 {
        rendered
            .lines()
            .find_map(|l| l.strip_prefix(&format!("{name} ")))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn totals_sum_ops_and_invalid() {
        let registry = Registry::new();
        registry.apply(Event::operation(Verb::Get, Operation::ListStatus));
        registry.apply(Event::operation(Verb::Get, Operation::ListStatus));
        registry.apply(Event::operation(Verb::Get, Operation::Open));
        registry.apply(Event::invalid(Verb::Get));
        registry.apply(Event::operation(Verb::Put, Operation::Create));
        registry.apply(Event::invalid(Verb::Post));

        let rendered = registry.render();
        assert_eq!(metric(&rendered, "webhdfs_get_liststatus"), 2);
        assert_eq!(metric(&rendered, "webhdfs_get_open"), 1);
        assert_eq!(metric(&rendered, "webhdfs_get_total"), 4);
        assert_eq!(metric(&rendered, "webhdfs_put_total"), 1);
        assert_eq!(metric(&rendered, "webhdfs_post_total"), 1);
        assert_eq!(metric(&rendered, "webhdfs_post_append"), 0);
        assert_eq!(metric(&rendered, "webhdfs_delete_total"), 0);
    }

    #[test]
    fn each_event_raises_the_sum_by_one() {
        let registry = Registry::new();
        let sum = |r: &Registry| {
            let rendered = r.render();
            ["webhdfs_get_total", "webhdfs_put_total", "webhdfs_post_total", "webhdfs_delete_total"]
                .iter()
                .map(|n| metric(&rendered, n))
                .sum::<u64>()
        };
        assert_eq!(sum(&registry), 0);
        registry.apply(Event::operation(Verb::Delete, Operation::Delete));
        assert_eq!(sum(&registry), 1);
        registry.apply(Event::invalid(Verb::Put));
        assert_eq!(sum(&registry), 2);
    }

    #[test]
    fn uptime_is_consistent_with_timestamps() {
        let rendered = Registry::new().render();
        let start = metric(&rendered, "proxy_start_timestamp");
        let current = metric(&rendered, "proxy_current_time");
        let uptime = metric(&rendered, "proxy_uptime");
        assert_eq!(current - start, uptime);
    }

    #[tokio::test]
    async fn consumer_drains_the_channel() {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(consume_events(registry.clone(), rx));
        tx.send(Event::operation(Verb::Post, Operation::Append)).unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(metric(&registry.render(), "webhdfs_post_append"), 1);
    }
}
