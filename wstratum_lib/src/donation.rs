// Copyright (C) 2024, 2025 Wstratum Developers (see AUTHORS)
//
// This file is part of Wstratum
//
// Wstratum is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wstratum is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Wstratum. If not, see <https://www.gnu.org/licenses/>.

//! A donation is a virtual miner on a secondary pool. It has no
//! downstream socket; the host miner periodically yields job time to it,
//! paying down a debt that accrues as a fixed share of wall-clock time.

use crate::error::Error;
use crate::messages::{Id, Job, LoginParams};
use crate::upstream::{RequestKind, SessionId, UpstreamHandle};
use std::time::{Duration, Instant};

/// How much donated time one delivered job is worth.
pub const JOB_TIME: Duration = Duration::from_secs(30);

/// Tracks how much job time a donation is owed.
#[derive(Debug, Clone)]
pub struct Ledger {
    percentage: f64,
    debt: Duration,
    last_accrual: Instant,
}

impl Ledger {
    pub fn new(percentage: f64, now: Instant) -> Self {
        Self {
            percentage,
            debt: Duration::ZERO,
            last_accrual: now,
        }
    }

    /// Grow the debt by the configured share of the time elapsed since
    /// the last accrual.
    pub fn accrue(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_accrual);
        self.debt += elapsed.mul_f64(self.percentage);
        self.last_accrual = now;
    }

    /// Whether the accumulated debt covers at least one job.
    pub fn owes_turn(&self) -> bool {
        self.debt >= JOB_TIME
    }

    /// Pay one job's worth of time off the debt.
    pub fn settle(&mut self) {
        self.debt = self.debt.saturating_sub(JOB_TIME);
    }

    pub fn debt(&self) -> Duration {
        self.debt
    }
}

/// A donation session bound to its own upstream connection. Owned by the
/// host miner; dies with it.
pub struct Donation {
    pub session_id: SessionId,
    pub upstream: UpstreamHandle,
    pub address: String,
    pub pass: String,
    pub worker_id: Option<String>,
    pub job: Option<Job>,
    pub accepted: u64,
    pub rejected: u64,
    pub alive: bool,
    ledger: Ledger,
}

impl Donation {
    pub fn new(
        session_id: SessionId,
        upstream: UpstreamHandle,
        address: String,
        pass: String,
        percentage: f64,
        now: Instant,
    ) -> Self {
        Self {
            session_id,
            upstream,
            address,
            pass,
            worker_id: None,
            job: None,
            accepted: 0,
            rejected: 0,
            alive: true,
            ledger: Ledger::new(percentage, now),
        }
    }

    /// Log in to the donation pool under the donation address. The
    /// response never reaches a browser, so the id is a fixed sentinel.
    pub async fn login(&self, agent: &str) -> Result<(), Error> {
        let params = LoginParams {
            login: self.address.clone(),
            pass: self.pass.clone(),
            agent: Some(agent.to_string()),
        };
        self.upstream
            .send(
                self.session_id,
                RequestKind::Login,
                Some(Id::Num(1)),
                serde_json::to_value(&params)?,
            )
            .await
    }

    pub fn accrue(&mut self, now: Instant) {
        self.ledger.accrue(now);
    }

    pub fn settle(&mut self) {
        self.ledger.settle();
    }

    /// Ready to take a job turn: alive, logged in, holding a job, and
    /// owed at least one job's worth of time.
    pub fn wants_turn(&self) -> bool {
        self.alive && self.worker_id.is_some() && self.job.is_some() && self.ledger.owes_turn()
    }

    pub fn debt(&self) -> Duration {
        self.ledger.debt()
    }
}

/// Accrue every donation's debt and pick the one owed the most, provided
/// it is owed at least one job. Ties keep the earliest entry.
pub fn pick_turn(donations: &mut [Donation], now: Instant) -> Option<usize> {
    for donation in donations.iter_mut() {
        if donation.alive {
            donation.accrue(now);
        }
    }

    let mut winner: Option<usize> = None;
    for (index, donation) in donations.iter().enumerate() {
        if !donation.wants_turn() {
            continue;
        }
        match winner {
            Some(current) if donations[current].debt() >= donation.debt() => {}
            _ => winner = Some(index),
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::spawn_upstream;

    fn test_donation(percentage: f64, now: Instant) -> (Donation, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let handle = spawn_upstream(99, "donate.test".to_string(), 3333, true, 100, ours);
        let mut donation = Donation::new(
            1,
            handle,
            "donate-wallet".to_string(),
            "x".to_string(),
            percentage,
            now,
        );
        donation.worker_id = Some("dw1".to_string());
        donation.job = Some(Job {
            job_id: "dj1".to_string(),
            blob: "ab".to_string(),
            target: "ffff0000".to_string(),
            id: None,
            extra: serde_json::Map::new(),
        });
        (donation, theirs)
    }

    #[test]
    fn test_ledger_accrues_share_of_elapsed_time() {
        let start = Instant::now();
        let mut ledger = Ledger::new(0.5, start);
        ledger.accrue(start + Duration::from_secs(10));
        assert_eq!(ledger.debt(), Duration::from_secs(5));

        ledger.accrue(start + Duration::from_secs(20));
        assert_eq!(ledger.debt(), Duration::from_secs(10));
    }

    #[test]
    fn test_ledger_settle_subtracts_one_job() {
        let start = Instant::now();
        let mut ledger = Ledger::new(1.0, start);
        ledger.accrue(start + JOB_TIME + Duration::from_secs(5));
        assert!(ledger.owes_turn());
        ledger.settle();
        assert_eq!(ledger.debt(), Duration::from_secs(5));
        assert!(!ledger.owes_turn());
    }

    #[tokio::test]
    async fn test_ten_percent_takes_the_eleventh_job() {
        let start = Instant::now();
        let (donation, _far) = test_donation(0.1, start);
        let mut donations = vec![donation];

        // Jobs arrive once per job time. Counting the login-embedded job
        // delivered at the start, the host keeps the first ten; the
        // eleventh goes to the donation.
        for delivery in 1..=10u32 {
            let now = start + JOB_TIME * delivery;
            let turn = pick_turn(&mut donations, now);
            if delivery < 10 {
                assert_eq!(turn, None, "delivery {} should stay with the host", delivery);
            } else {
                assert_eq!(turn, Some(0));
                donations[0].settle();
            }
        }

        // Debt was fully settled; the cycle starts over.
        let turn = pick_turn(&mut donations, start + JOB_TIME * 11);
        assert_eq!(turn, None);
    }

    #[tokio::test]
    async fn test_largest_debt_wins_and_ties_keep_insertion_order() {
        let start = Instant::now();
        let (first, _far1) = test_donation(0.2, start);
        let (mut second, _far2) = test_donation(0.4, start);
        second.session_id = 2;
        let mut donations = vec![first, second];

        let now = start + JOB_TIME * 5;
        // 0.2 * 150s = 30s, 0.4 * 150s = 60s; both owe a turn.
        assert_eq!(pick_turn(&mut donations, now), Some(1));

        // Equal percentages accrue equal debt; the first entry wins.
        let (first, _far3) = test_donation(0.5, start);
        let (mut second, _far4) = test_donation(0.5, start);
        second.session_id = 2;
        let mut tied = vec![first, second];
        assert_eq!(pick_turn(&mut tied, start + JOB_TIME * 2), Some(0));
    }

    #[tokio::test]
    async fn test_donation_without_job_or_login_never_takes_a_turn() {
        let start = Instant::now();
        let (donation, _far) = test_donation(1.0, start);
        let mut donations = vec![donation];
        donations[0].job = None;
        assert_eq!(pick_turn(&mut donations, start + JOB_TIME * 2), None);

        donations[0].job = Some(Job {
            job_id: "dj1".to_string(),
            blob: "ab".to_string(),
            target: "ffff0000".to_string(),
            id: None,
            extra: serde_json::Map::new(),
        });
        donations[0].worker_id = None;
        assert_eq!(pick_turn(&mut donations, start + JOB_TIME * 3), None);

        donations[0].worker_id = Some("dw1".to_string());
        donations[0].alive = false;
        assert_eq!(pick_turn(&mut donations, start + JOB_TIME * 4), None);
    }
}
