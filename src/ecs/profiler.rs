//! Per-system timings for the fixed and frame schedules.

use bevy_ecs::prelude::{Resource, World};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TickKind {
    Fixed,
    Frame,
}

#[derive(Clone, Copy, Debug)]
pub struct SystemTimingSummary {
    pub name: &'static str,
    pub last_ms: f32,
    pub average_ms: f32,
    pub max_ms: f32,
    pub samples: u64,
}

#[derive(Default, Clone, Copy)]
struct Timing {
    last_ms: f32,
    total_ms: f32,
    max_ms: f32,
    samples: u64,
}

impl Timing {
    fn push(&mut self, ms: f32) {
        self.last_ms = ms;
        self.max_ms = self.max_ms.max(ms);
        self.total_ms += ms;
        self.samples += 1;
    }

    fn summary(&self, name: &'static str) -> SystemTimingSummary {
        let average_ms = if self.samples == 0 { 0.0 } else { self.total_ms / self.samples as f32 };
        SystemTimingSummary { name, last_ms: self.last_ms, average_ms, max_ms: self.max_ms, samples: self.samples }
    }
}

#[derive(Resource, Default)]
pub struct SystemProfiler {
    timings: HashMap<&'static str, Timing>,
    fixed_ticks: u64,
    frame_ticks: u64,
}

impl SystemProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_tick(&mut self, kind: TickKind) {
        match kind {
            TickKind::Fixed => self.fixed_ticks += 1,
            TickKind::Frame => self.frame_ticks += 1,
        }
    }

    pub fn ticks(&self, kind: TickKind) -> u64 {
        match kind {
            TickKind::Fixed => self.fixed_ticks,
            TickKind::Frame => self.frame_ticks,
        }
    }

    pub fn scope(&mut self, name: &'static str) -> SystemProfileScope<'_> {
        SystemProfileScope { name, profiler: self, start: Instant::now() }
    }

    pub(crate) fn record_since(&mut self, name: &'static str, start: Instant) {
        self.timings.entry(name).or_default().push(start.elapsed().as_secs_f32() * 1000.0);
    }

    pub fn samples(&self, name: &str) -> u64 {
        self.timings.get(name).map_or(0, |timing| timing.samples)
    }

    pub fn summary(&self, name: &str) -> Option<SystemTimingSummary> {
        self.timings.get_key_value(name).map(|(&name, timing)| timing.summary(name))
    }

    /// Slowest average first; equal averages fall back to name order.
    pub fn summaries(&self) -> Vec<SystemTimingSummary> {
        let mut out: Vec<SystemTimingSummary> =
            self.timings.iter().map(|(&name, timing)| timing.summary(name)).collect();
        out.sort_by(|a, b| b.average_ms.total_cmp(&a.average_ms).then_with(|| a.name.cmp(b.name)));
        out
    }

    pub fn reset(&mut self) {
        self.timings.clear();
        self.fixed_ticks = 0;
        self.frame_ticks = 0;
    }
}

pub struct SystemProfileScope<'a> {
    name: &'static str,
    profiler: &'a mut SystemProfiler,
    start: Instant,
}

impl Drop for SystemProfileScope<'_> {
    fn drop(&mut self) {
        self.profiler.record_since(self.name, self.start);
    }
}

/// Times an exclusive system body, which cannot hold a `ResMut` scope across world access.
pub(crate) fn profile_exclusive<R>(world: &mut World, name: &'static str, body: impl FnOnce(&mut World) -> R) -> R {
    let start = Instant::now();
    let result = body(world);
    if let Some(mut profiler) = world.get_resource_mut::<SystemProfiler>() {
        profiler.record_since(name, start);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_accumulate_per_system() {
        let mut profiler = SystemProfiler::new();
        for _ in 0..3 {
            let _span = profiler.scope("sys_a");
        }
        drop(profiler.scope("sys_b"));
        profiler.begin_tick(TickKind::Fixed);

        assert_eq!(profiler.samples("sys_a"), 3);
        assert_eq!(profiler.summary("sys_b").map(|s| s.samples), Some(1));
        assert_eq!(profiler.summaries().len(), 2);
        assert_eq!(profiler.ticks(TickKind::Fixed), 1);
        assert_eq!(profiler.ticks(TickKind::Frame), 0);

        profiler.reset();
        assert!(profiler.summaries().is_empty());
        assert_eq!(profiler.ticks(TickKind::Fixed), 0);
    }
}
