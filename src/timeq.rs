/*
Time-queue for the fabric model.

Each fixed-latency resource is wrapped by a TimedServer, which enforces a service law:
    - A base latency plus a throughput component expressed in bytes-per-cycle

When the server cannot accept more work it returns a Backpressure, which hands the request
back so the caller can hold it and retry on a later cycle.

Accepted requests yield a `Ticket` describing when the service will complete. The owner polls
the server each cycle and retires the front entry once its ticket is ready.
*/

use std::collections::VecDeque;

use crate::base::module::IsModule;

pub type Cycle = u64;

// Helper to read the current cycle from any module
pub fn module_now<M: IsModule>(module: &M) -> Cycle {
    module.base_ref().cycle
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle, size_bytes: u32) -> Self {
        Self {
            issued_at,
            ready_at,
            size_bytes,
        }
    }

    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server makes the payload available to the owner.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }

    // Number of cycles until the ticket is ready.  Returns zero if already ready.
    pub fn remaining_cycles(&self, now: Cycle) -> Cycle {
        self.ready_at.saturating_sub(now)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self { payload, size_bytes }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

// Reasons why the server rejected a request
#[derive(Debug)]
pub enum Backpressure<T> {
    // The bounded FIFO is full
    QueueFull { request: ServiceRequest<T>, capacity: usize },
    // The server is still serving earlier work
    Busy { request: ServiceRequest<T>, available_at: Cycle },
}

impl<T> Backpressure<T> {
    // Recover the underlying request so it can be retried later.
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
            Backpressure::Busy { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Single-lane server that enforces the configured latency/bandwidth budget and keeps track of
// outstanding work using a FIFO.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
        }
    }

    // Attempt to enqueue a request at the provided cycle.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let available_at = self.busy_until.max(now);
        if available_at > now && self.inflight.is_empty() {
            return Err(Backpressure::Busy {
                request,
                available_at,
            });
        }

        let ready_at = self.next_ready_cycle(available_at, request.size_bytes);
        let ticket = Ticket::new(now, ready_at, request.size_bytes);

        self.busy_until = ready_at;
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });

        Ok(ticket)
    }

    /// Oldest entry, if its ticket is ready at `now`.
    pub fn peek_ready(&self, now: Cycle) -> Option<(&T, &Ticket)> {
        self.inflight
            .front()
            .filter(|front| front.ticket.is_ready(now))
            .map(|front| (&front.payload, &front.ticket))
    }

    /// Retire the oldest entry if its ticket is ready at `now`.
    pub fn pop_ready(&mut self, now: Cycle) -> Option<ServiceResult<T>> {
        if self.peek_ready(now).is_none() {
            return None;
        }
        let inflight = self.inflight.pop_front().expect("front just checked");
        if self.inflight.is_empty() && now > self.busy_until {
            self.busy_until = now;
        }
        Some(ServiceResult {
            payload: inflight.payload,
            ticket: inflight.ticket,
        })
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    // Returns the earliest cycle at which a new request could begin service.
    pub fn available_at(&self) -> Cycle {
        self.busy_until
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.inflight.front().map(|inflight| &inflight.ticket)
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
        self.busy_until = 0;
    }

    fn next_ready_cycle(&self, start: Cycle, size_bytes: u32) -> Cycle {
        let service_cycles = ceil_div_u64(size_bytes as u64, self.config.bytes_per_cycle as u64);
        start
            .saturating_add(self.config.base_latency)
            .saturating_add(service_cycles)
    }
}

fn ceil_div_u64(nom: u64, denom: u64) -> Cycle {
    debug_assert!(denom > 0);
    (nom + denom - 1) / denom
}
