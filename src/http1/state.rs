/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::port::Accounting;
use std::fmt;
use std::time::Instant;

/// Lifecycle of one physical connection.
///
/// `Nka` variants mark a connection that has already been decided to close
/// after the current exchange. They can never move back into keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    // allocated, no socket yet
    Init,
    // socket accepted, no request read yet
    Accept,
    // between requests, reading the next request line
    RequestRead,
    // request being handled
    RequestActive,
    // request being handled, connection will close afterwards
    RequestNka,
    // waiting for the next request on a worker thread
    RequestKeepalive,
    // waiting for the next request in the selector
    RequestKeepaliveSelect,
    Comet,
    CometNka,
    CometSuspend,
    CometSuspendNka,
    CometComplete,
    CometCompleteNka,
    Duplex,
    DuplexKeepalive,
    Closed,
    // pooled, ready for reuse
    Idle,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Init,
    Accept,
    Read,
    Active,
    KillKeepalive,
    Keepalive,
    KeepaliveSelect,
    FinishRequest,
    Comet,
    CometSuspend,
    CometResume,
    CometComplete,
    Duplex,
    DuplexActive,
    Closed,
    Idle,
    Destroy,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Accept => "accept",
            Self::Read => "read",
            Self::Active => "active",
            Self::KillKeepalive => "kill-keepalive",
            Self::Keepalive => "keepalive",
            Self::KeepaliveSelect => "keepalive-select",
            Self::FinishRequest => "finish-request",
            Self::Comet => "comet",
            Self::CometSuspend => "comet-suspend",
            Self::CometResume => "comet-resume",
            Self::CometComplete => "comet-complete",
            Self::Duplex => "duplex",
            Self::DuplexActive => "duplex-active",
            Self::Closed => "closed",
            Self::Idle => "idle",
            Self::Destroy => "destroy",
        };

        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {transition} from state {state:?}")]
pub struct IllegalTransition {
    pub state: ConnectionState,
    pub transition: Transition,
}

type TransitionResult = Result<ConnectionState, IllegalTransition>;

use ConnectionState::*;

impl ConnectionState {
    fn illegal(self, transition: Transition) -> TransitionResult {
        Err(IllegalTransition {
            state: self,
            transition,
        })
    }

    pub fn is_idle(self) -> bool {
        self == Idle
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestActive | RequestNka | Comet | CometNka | CometComplete | CometCompleteNka
        )
    }

    pub fn is_request_active(self) -> bool {
        matches!(self, RequestActive | RequestNka)
    }

    pub fn is_allow_keepalive(self) -> bool {
        matches!(
            self,
            RequestRead
                | RequestActive
                | RequestKeepalive
                | RequestKeepaliveSelect
                | Comet
                | CometSuspend
                | CometComplete
                | Duplex
                | DuplexKeepalive
        )
    }

    pub fn is_keepalive(self) -> bool {
        matches!(
            self,
            RequestKeepalive | RequestKeepaliveSelect | DuplexKeepalive
        )
    }

    pub fn is_comet(self) -> bool {
        matches!(
            self,
            Comet | CometNka | CometSuspend | CometSuspendNka | CometComplete | CometCompleteNka
        )
    }

    pub fn is_comet_active(self) -> bool {
        matches!(self, Comet | CometNka)
    }

    pub fn is_comet_suspend(self) -> bool {
        matches!(self, CometSuspend | CometSuspendNka)
    }

    pub fn is_comet_complete(self) -> bool {
        matches!(self, CometComplete | CometCompleteNka)
    }

    pub fn is_duplex(self) -> bool {
        matches!(self, Duplex | DuplexKeepalive)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Closed | Idle | Destroyed)
    }

    pub fn is_destroyed(self) -> bool {
        self == Destroyed
    }

    pub fn is_allow_idle(self) -> bool {
        self == Closed
    }

    pub fn to_init(self) -> TransitionResult {
        match self {
            Idle | Init | Closed => Ok(Init),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Init),
        }
    }

    pub fn to_accept(self) -> TransitionResult {
        match self {
            Init | Idle | Closed => Ok(Accept),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Accept),
        }
    }

    pub fn to_read(self) -> TransitionResult {
        match self {
            Accept => Ok(RequestRead),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Read),
        }
    }

    // leaving a keepalive wait releases the keepalive slot
    pub fn to_active(
        self,
        port: &dyn Accounting,
        connection_start: Instant,
    ) -> TransitionResult {
        let allowed = || port.is_keepalive_allowed(connection_start);

        match self {
            Accept | RequestRead => Ok(if allowed() { RequestActive } else { RequestNka }),
            RequestKeepalive | RequestKeepaliveSelect => {
                port.keepalive_end();

                Ok(if allowed() { RequestActive } else { RequestNka })
            }
            RequestActive | RequestNka => Ok(self),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Active),
        }
    }

    pub fn to_kill_keepalive(self) -> TransitionResult {
        match self {
            RequestRead | RequestActive | RequestNka => Ok(RequestNka),
            Comet | CometNka => Ok(CometNka),
            CometSuspend | CometSuspendNka => Ok(CometSuspendNka),
            CometComplete | CometCompleteNka => Ok(CometCompleteNka),
            Duplex | DuplexKeepalive | Closed | Destroyed => Ok(self),
            _ => self.illegal(Transition::KillKeepalive),
        }
    }

    pub fn to_keepalive(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            RequestRead | RequestActive | CometComplete => Ok(RequestKeepalive),
            Duplex => {
                port.duplex_keepalive_begin();

                Ok(DuplexKeepalive)
            }
            DuplexKeepalive => Ok(self),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Keepalive),
        }
    }

    pub fn to_keepalive_select(self) -> TransitionResult {
        match self {
            RequestKeepalive => Ok(RequestKeepaliveSelect),
            DuplexKeepalive => Ok(self),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::KeepaliveSelect),
        }
    }

    pub fn to_finish_request(self) -> TransitionResult {
        match self {
            RequestActive | CometComplete => Ok(RequestRead),
            RequestNka | CometCompleteNka => Ok(RequestNka),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::FinishRequest),
        }
    }

    pub fn to_comet(self) -> TransitionResult {
        match self {
            RequestActive | Comet => Ok(Comet),
            RequestNka | CometNka => Ok(CometNka),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Comet),
        }
    }

    pub fn to_comet_suspend(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            Comet => {
                port.comet_suspend();

                Ok(CometSuspend)
            }
            CometNka => {
                port.comet_suspend();

                Ok(CometSuspendNka)
            }
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::CometSuspend),
        }
    }

    pub fn to_comet_resume(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            CometSuspend => {
                port.comet_detach();

                Ok(Comet)
            }
            CometSuspendNka => {
                port.comet_detach();

                Ok(CometNka)
            }
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::CometResume),
        }
    }

    pub fn to_comet_complete(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            Comet | CometComplete => Ok(CometComplete),
            CometNka | CometCompleteNka => Ok(CometCompleteNka),
            CometSuspend => {
                port.comet_detach();

                Ok(CometComplete)
            }
            CometSuspendNka => {
                port.comet_detach();

                Ok(CometCompleteNka)
            }
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::CometComplete),
        }
    }

    pub fn to_duplex(self) -> TransitionResult {
        match self {
            RequestActive | RequestNka => Ok(Duplex),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Duplex),
        }
    }

    pub fn to_duplex_active(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            Duplex => Ok(Duplex),
            DuplexKeepalive => {
                port.duplex_keepalive_end();

                Ok(Duplex)
            }
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::DuplexActive),
        }
    }

    // releases whatever the current state holds
    fn exit(self, port: &dyn Accounting) {
        match self {
            RequestKeepalive | RequestKeepaliveSelect => port.keepalive_end(),
            DuplexKeepalive => port.duplex_keepalive_end(),
            CometSuspend | CometSuspendNka => port.comet_detach(),
            _ => {}
        }
    }

    pub fn to_closed(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            Destroyed => Ok(Destroyed),
            Closed => Ok(Closed),
            _ => {
                self.exit(port);

                Ok(Closed)
            }
        }
    }

    pub fn to_idle(self) -> TransitionResult {
        match self {
            Init | Closed => Ok(Idle),
            Destroyed => Ok(Destroyed),
            _ => self.illegal(Transition::Idle),
        }
    }

    pub fn to_destroy(self, port: &dyn Accounting) -> TransitionResult {
        match self {
            Idle => self.illegal(Transition::Destroy),
            Destroyed => Ok(Destroyed),
            _ => {
                self.exit(port);

                Ok(Destroyed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::test::RecordingAccounting;

    const ALL: [ConnectionState; 18] = [
        Init,
        Accept,
        RequestRead,
        RequestActive,
        RequestNka,
        RequestKeepalive,
        RequestKeepaliveSelect,
        Comet,
        CometNka,
        CometSuspend,
        CometSuspendNka,
        CometComplete,
        CometCompleteNka,
        Duplex,
        DuplexKeepalive,
        Closed,
        Idle,
        Destroyed,
    ];

    fn apply(
        state: ConnectionState,
        t: Transition,
        port: &dyn Accounting,
    ) -> TransitionResult {
        let start = Instant::now();

        match t {
            Transition::Init => state.to_init(),
            Transition::Accept => state.to_accept(),
            Transition::Read => state.to_read(),
            Transition::Active => state.to_active(port, start),
            Transition::KillKeepalive => state.to_kill_keepalive(),
            Transition::Keepalive => state.to_keepalive(port),
            Transition::KeepaliveSelect => state.to_keepalive_select(),
            Transition::FinishRequest => state.to_finish_request(),
            Transition::Comet => state.to_comet(),
            Transition::CometSuspend => state.to_comet_suspend(port),
            Transition::CometResume => state.to_comet_resume(port),
            Transition::CometComplete => state.to_comet_complete(port),
            Transition::Duplex => state.to_duplex(),
            Transition::DuplexActive => state.to_duplex_active(port),
            Transition::Closed => state.to_closed(port),
            Transition::Idle => state.to_idle(),
            Transition::Destroy => state.to_destroy(port),
        }
    }

    #[test]
    fn test_transition_table() {
        struct Test {
            name: &'static str,
            from: ConnectionState,
            transition: Transition,
            to: Option<ConnectionState>,
            calls: &'static [&'static str],
        }

        let tests = [
            Test {
                name: "accept-read",
                from: Accept,
                transition: Transition::Read,
                to: Some(RequestRead),
                calls: &[],
            },
            Test {
                name: "read-active",
                from: RequestRead,
                transition: Transition::Active,
                to: Some(RequestActive),
                calls: &[],
            },
            Test {
                name: "keepalive-active",
                from: RequestKeepalive,
                transition: Transition::Active,
                to: Some(RequestActive),
                calls: &["keepalive_end"],
            },
            Test {
                name: "keepalive-select-active",
                from: RequestKeepaliveSelect,
                transition: Transition::Active,
                to: Some(RequestActive),
                calls: &["keepalive_end"],
            },
            Test {
                name: "active-keepalive",
                from: RequestActive,
                transition: Transition::Keepalive,
                to: Some(RequestKeepalive),
                calls: &[],
            },
            Test {
                name: "nka-keepalive",
                from: RequestNka,
                transition: Transition::Keepalive,
                to: None,
                calls: &[],
            },
            Test {
                name: "comet-nka-keepalive",
                from: CometNka,
                transition: Transition::Keepalive,
                to: None,
                calls: &[],
            },
            Test {
                name: "comet-complete-keepalive",
                from: CometComplete,
                transition: Transition::Keepalive,
                to: Some(RequestKeepalive),
                calls: &[],
            },
            Test {
                name: "comet-suspend",
                from: Comet,
                transition: Transition::CometSuspend,
                to: Some(CometSuspend),
                calls: &["comet_suspend"],
            },
            Test {
                name: "comet-nka-suspend",
                from: CometNka,
                transition: Transition::CometSuspend,
                to: Some(CometSuspendNka),
                calls: &["comet_suspend"],
            },
            Test {
                name: "comet-complete-suspend",
                from: CometComplete,
                transition: Transition::CometSuspend,
                to: None,
                calls: &[],
            },
            Test {
                name: "comet-complete-nka-suspend",
                from: CometCompleteNka,
                transition: Transition::CometSuspend,
                to: None,
                calls: &[],
            },
            Test {
                name: "suspend-resume",
                from: CometSuspendNka,
                transition: Transition::CometResume,
                to: Some(CometNka),
                calls: &["comet_detach"],
            },
            Test {
                name: "suspend-complete",
                from: CometSuspend,
                transition: Transition::CometComplete,
                to: Some(CometComplete),
                calls: &["comet_detach"],
            },
            Test {
                name: "complete-finish",
                from: CometCompleteNka,
                transition: Transition::FinishRequest,
                to: Some(RequestNka),
                calls: &[],
            },
            Test {
                name: "nka-duplex",
                from: RequestNka,
                transition: Transition::Duplex,
                to: Some(Duplex),
                calls: &[],
            },
            Test {
                name: "duplex-keepalive",
                from: Duplex,
                transition: Transition::Keepalive,
                to: Some(DuplexKeepalive),
                calls: &["duplex_keepalive_begin"],
            },
            Test {
                name: "duplex-keepalive-active",
                from: DuplexKeepalive,
                transition: Transition::DuplexActive,
                to: Some(Duplex),
                calls: &["duplex_keepalive_end"],
            },
            Test {
                name: "duplex-kill-keepalive",
                from: Duplex,
                transition: Transition::KillKeepalive,
                to: Some(Duplex),
                calls: &[],
            },
            Test {
                name: "select-closed",
                from: RequestKeepaliveSelect,
                transition: Transition::Closed,
                to: Some(Closed),
                calls: &["keepalive_end"],
            },
            Test {
                name: "suspend-destroy",
                from: CometSuspend,
                transition: Transition::Destroy,
                to: Some(Destroyed),
                calls: &["comet_detach"],
            },
            Test {
                name: "idle-destroy",
                from: Idle,
                transition: Transition::Destroy,
                to: None,
                calls: &[],
            },
            Test {
                name: "idle-init",
                from: Idle,
                transition: Transition::Init,
                to: Some(Init),
                calls: &[],
            },
            Test {
                name: "closed-idle",
                from: Closed,
                transition: Transition::Idle,
                to: Some(Idle),
                calls: &[],
            },
            Test {
                name: "active-idle",
                from: RequestActive,
                transition: Transition::Idle,
                to: None,
                calls: &[],
            },
        ];

        for test in tests.iter() {
            let port = RecordingAccounting::new();
            let result = apply(test.from, test.transition, &port);

            match test.to {
                Some(to) => assert_eq!(result, Ok(to), "test={}", test.name),
                None => assert_eq!(
                    result,
                    Err(IllegalTransition {
                        state: test.from,
                        transition: test.transition,
                    }),
                    "test={}",
                    test.name
                ),
            }

            assert_eq!(port.calls(), test.calls, "test={}", test.name);
        }
    }

    #[test]
    fn test_active_without_keepalive() {
        let port = RecordingAccounting::deny_keepalive_after(0);

        let state = Accept.to_active(&port, Instant::now()).unwrap();
        assert_eq!(state, RequestNka);
        assert!(state.is_request_active());
        assert!(!state.is_allow_keepalive());

        // deciding to close is permanent for the request states
        assert_eq!(state.to_finish_request(), Ok(RequestNka));
        assert!(state.to_keepalive(&port).is_err());
    }

    #[test]
    fn test_destroyed_absorbs() {
        let port = RecordingAccounting::new();

        let transitions = [
            Transition::Init,
            Transition::Accept,
            Transition::Read,
            Transition::Active,
            Transition::KillKeepalive,
            Transition::Keepalive,
            Transition::KeepaliveSelect,
            Transition::FinishRequest,
            Transition::Comet,
            Transition::CometSuspend,
            Transition::CometResume,
            Transition::CometComplete,
            Transition::Duplex,
            Transition::DuplexActive,
            Transition::Closed,
            Transition::Idle,
            Transition::Destroy,
        ];

        for t in transitions {
            assert_eq!(apply(Destroyed, t, &port), Ok(Destroyed), "t={}", t);
        }

        assert!(port.calls().is_empty());
    }

    #[test]
    fn test_closed_always_legal() {
        for state in ALL {
            let port = RecordingAccounting::new();
            let result = state.to_closed(&port).unwrap();

            if state == Destroyed {
                assert_eq!(result, Destroyed);
            } else {
                assert_eq!(result, Closed, "state={:?}", state);
            }

            assert!(result.is_closed());
        }
    }

    #[test]
    fn test_kill_keepalive_never_allows_keepalive() {
        for state in ALL {
            let port = RecordingAccounting::new();

            if let Ok(next) = state.to_kill_keepalive() {
                if next.is_duplex() || next.is_closed() {
                    continue;
                }

                assert!(!next.is_allow_keepalive(), "state={:?}", state);
                assert!(next.to_keepalive(&port).is_err(), "state={:?}", state);
            }
        }
    }

    #[test]
    fn test_predicates() {
        struct Test {
            state: ConnectionState,
            active: bool,
            keepalive: bool,
            allow_keepalive: bool,
            comet: bool,
            duplex: bool,
            closed: bool,
        }

        let tests = [
            Test {
                state: RequestActive,
                active: true,
                keepalive: false,
                allow_keepalive: true,
                comet: false,
                duplex: false,
                closed: false,
            },
            Test {
                state: RequestKeepaliveSelect,
                active: false,
                keepalive: true,
                allow_keepalive: true,
                comet: false,
                duplex: false,
                closed: false,
            },
            Test {
                state: CometSuspendNka,
                active: false,
                keepalive: false,
                allow_keepalive: false,
                comet: true,
                duplex: false,
                closed: false,
            },
            Test {
                state: CometComplete,
                active: true,
                keepalive: false,
                allow_keepalive: true,
                comet: true,
                duplex: false,
                closed: false,
            },
            Test {
                state: DuplexKeepalive,
                active: false,
                keepalive: true,
                allow_keepalive: true,
                comet: false,
                duplex: true,
                closed: false,
            },
            Test {
                state: Idle,
                active: false,
                keepalive: false,
                allow_keepalive: false,
                comet: false,
                duplex: false,
                closed: true,
            },
        ];

        for test in tests.iter() {
            let s = test.state;
            assert_eq!(s.is_active(), test.active, "state={:?}", s);
            assert_eq!(s.is_keepalive(), test.keepalive, "state={:?}", s);
            assert_eq!(s.is_allow_keepalive(), test.allow_keepalive, "state={:?}", s);
            assert_eq!(s.is_comet(), test.comet, "state={:?}", s);
            assert_eq!(s.is_duplex(), test.duplex, "state={:?}", s);
            assert_eq!(s.is_closed(), test.closed, "state={:?}", s);
        }
    }
}
