//! The failover state machine. Pure transitions, no I/O; the peer task
//! feeds it events and reacts to the transitions it returns.
use config::Role;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaState {
    Init,
    Connecting,
    Standby,
    Active,
    PartnerDown,
    Recovery,
}

impl HaState {
    /// only the node in `Active` or `PartnerDown` answers DHCP
    pub fn answers_dhcp(&self) -> bool {
        matches!(self, HaState::Active | HaState::PartnerDown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HaState::Init => "init",
            HaState::Connecting => "connecting",
            HaState::Standby => "standby",
            HaState::Active => "active",
            HaState::PartnerDown => "partner_down",
            HaState::Recovery => "recovery",
        }
    }

    /// stable integer for the state gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            HaState::Init => 0,
            HaState::Connecting => 1,
            HaState::Standby => 2,
            HaState::Active => 3,
            HaState::PartnerDown => 4,
            HaState::Recovery => 5,
        }
    }
}

impl std::fmt::Display for HaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    /// process start
    Start,
    /// authenticated Hello exchange completed
    HelloExchanged { peer_role: Role },
    /// peer told us it took over while we were gone
    FailoverDeclared,
    /// no heartbeat inside failover_timeout
    HeartbeatTimeout,
    /// peer said goodbye gracefully
    PeerBye,
    /// partner is down and we begin answering
    Takeover,
    /// initial/recovery sync exchange finished
    SyncComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HaState,
    pub to: HaState,
}

impl Transition {
    /// transitions into or out of the serving states fire `ha.failover`
    pub fn is_failover(&self) -> bool {
        self.from.answers_dhcp() != self.to.answers_dhcp()
            || (self.from.answers_dhcp() && self.to.answers_dhcp() && self.from != self.to)
    }
}

#[derive(Debug)]
pub struct Fsm {
    role: Role,
    state: HaState,
}

impl Fsm {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: HaState::Init,
        }
    }

    pub fn state(&self) -> HaState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Apply one event. Returns the transition taken, or None when the
    /// event does not move this (state, role).
    pub fn handle(&mut self, event: FsmEvent) -> Option<Transition> {
        use FsmEvent::*;
        use HaState::*;
        let to = match (self.state, event, self.role) {
            (Init, Start, Role::Primary) => Active,
            (Init, Start, Role::Secondary) => Connecting,

            (Connecting, HelloExchanged { .. }, _) => Standby,

            // missed heartbeats: the standby walks through partner_down
            // and takes over; the active node simply serves alone
            (Standby, HeartbeatTimeout, _) => PartnerDown,
            (Standby, PeerBye, _) => PartnerDown,
            (PartnerDown, Takeover, _) => Active,
            (Active, HeartbeatTimeout, _) => PartnerDown,

            // the partner reappeared: reconcile state before resuming
            (PartnerDown, HelloExchanged { .. }, _) => Recovery,
            // true primary came back while this secondary was serving
            (Active, HelloExchanged { peer_role: Role::Primary }, Role::Secondary) => Recovery,
            // secondary informs a returning primary it holds the service
            (Active, FailoverDeclared, Role::Primary) => Recovery,

            (Recovery, SyncComplete, Role::Primary) => Active,
            (Recovery, SyncComplete, Role::Secondary) => Standby,
            (Recovery, HeartbeatTimeout, _) => PartnerDown,

            _ => {
                debug!(state = %self.state, ?event, "fsm event ignored");
                return None;
            }
        };
        let transition = Transition {
            from: self.state,
            to,
        };
        info!(from = %transition.from, to = %transition.to, role = %self.role, "ha state transition");
        self.state = to;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(fsm: &mut Fsm, events: &[FsmEvent]) -> HaState {
        for &ev in events {
            fsm.handle(ev);
        }
        fsm.state()
    }

    #[test]
    fn primary_starts_active() {
        let mut fsm = Fsm::new(Role::Primary);
        assert_eq!(drive(&mut fsm, &[FsmEvent::Start]), HaState::Active);
        assert!(fsm.state().answers_dhcp());
    }

    #[test]
    fn secondary_joins_standby() {
        let mut fsm = Fsm::new(Role::Secondary);
        fsm.handle(FsmEvent::Start);
        assert_eq!(fsm.state(), HaState::Connecting);
        assert!(!fsm.state().answers_dhcp());
        fsm.handle(FsmEvent::HelloExchanged {
            peer_role: Role::Primary,
        });
        assert_eq!(fsm.state(), HaState::Standby);
        assert!(!fsm.state().answers_dhcp());
    }

    #[test]
    fn standby_fails_over_on_missed_heartbeats() {
        let mut fsm = Fsm::new(Role::Secondary);
        drive(
            &mut fsm,
            &[
                FsmEvent::Start,
                FsmEvent::HelloExchanged {
                    peer_role: Role::Primary,
                },
            ],
        );
        let t = fsm.handle(FsmEvent::HeartbeatTimeout).unwrap();
        assert_eq!(t.to, HaState::PartnerDown);
        assert!(t.is_failover());
        let t = fsm.handle(FsmEvent::Takeover).unwrap();
        assert_eq!(t.to, HaState::Active);
        assert!(fsm.state().answers_dhcp());
    }

    #[test]
    fn serving_secondary_stands_down_for_returning_primary() {
        let mut fsm = Fsm::new(Role::Secondary);
        drive(
            &mut fsm,
            &[
                FsmEvent::Start,
                FsmEvent::HelloExchanged {
                    peer_role: Role::Primary,
                },
                FsmEvent::HeartbeatTimeout,
                FsmEvent::Takeover,
            ],
        );
        assert_eq!(fsm.state(), HaState::Active);
        // primary re-announces
        fsm.handle(FsmEvent::HelloExchanged {
            peer_role: Role::Primary,
        });
        assert_eq!(fsm.state(), HaState::Recovery);
        assert!(!fsm.state().answers_dhcp());
        fsm.handle(FsmEvent::SyncComplete);
        assert_eq!(fsm.state(), HaState::Standby);
    }

    #[test]
    fn returning_primary_recovers_then_serves() {
        let mut fsm = Fsm::new(Role::Primary);
        fsm.handle(FsmEvent::Start);
        // secondary says it took over while we were gone
        fsm.handle(FsmEvent::FailoverDeclared);
        assert_eq!(fsm.state(), HaState::Recovery);
        assert!(!fsm.state().answers_dhcp());
        fsm.handle(FsmEvent::SyncComplete);
        assert_eq!(fsm.state(), HaState::Active);
    }

    #[test]
    fn active_primary_rides_out_peer_loss() {
        let mut fsm = Fsm::new(Role::Primary);
        fsm.handle(FsmEvent::Start);
        let t = fsm.handle(FsmEvent::HeartbeatTimeout).unwrap();
        assert_eq!(t.to, HaState::PartnerDown);
        // still serving
        assert!(fsm.state().answers_dhcp());
        // peer reappears: reconcile, then back to active
        fsm.handle(FsmEvent::HelloExchanged {
            peer_role: Role::Secondary,
        });
        assert_eq!(fsm.state(), HaState::Recovery);
        fsm.handle(FsmEvent::SyncComplete);
        assert_eq!(fsm.state(), HaState::Active);
    }

    #[test]
    fn connecting_never_serves_without_adjacency() {
        let mut fsm = Fsm::new(Role::Secondary);
        fsm.handle(FsmEvent::Start);
        // a secondary that has never formed adjacency stays silent
        assert!(fsm.handle(FsmEvent::HeartbeatTimeout).is_none());
        assert_eq!(fsm.state(), HaState::Connecting);
    }

    #[test]
    fn graceful_bye_promotes_standby() {
        let mut fsm = Fsm::new(Role::Secondary);
        drive(
            &mut fsm,
            &[
                FsmEvent::Start,
                FsmEvent::HelloExchanged {
                    peer_role: Role::Primary,
                },
            ],
        );
        fsm.handle(FsmEvent::PeerBye);
        assert_eq!(fsm.state(), HaState::PartnerDown);
    }
}
