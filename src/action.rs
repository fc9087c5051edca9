use crate::message::Transport;

/// Outcome class of a protocol decision.
#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
pub enum ActionKind {
    NoAction,
    Send,
    InsertMafWaitAddress,
    InsertMafWaitSnoop,
    InsertMafWaitEvict,
    InsertMafWaitResponse,
    InsertMafWaitProbe,
    ReplyAndRemoveMaf,
    ReplyAndRemoveResponseMaf,
    InsertMafWaitRegion,
    RetryRequest,
    ReplyAndRetryMaf,
    ReplyAndInsertMafWaitResponse,
}

impl ActionKind {
    /// The MAF wait state a blocked request is parked in.
    #[must_use]
    pub fn blocked_state(self) -> Option<crate::maf::WaitState> {
        use crate::maf::WaitState;
        match self {
            Self::InsertMafWaitAddress => Some(WaitState::WaitAddress),
            Self::InsertMafWaitSnoop => Some(WaitState::WaitSnoop),
            Self::InsertMafWaitEvict => Some(WaitState::WaitEvict),
            Self::InsertMafWaitRegion => Some(WaitState::WaitRegion),
            _ => None,
        }
    }
}

/// Decision of the protocol for one message.
///
/// A direction carries a transport exactly when a message is sent that
/// way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub front: Option<Transport>,
    pub back: Option<Transport>,
    pub front_to_d: bool,
    pub front_to_i: bool,
    /// Data array accesses needed.
    pub requires_data: u32,
    /// Tag array accesses needed.
    pub requires_tag: u32,
    pub wake_snoops: bool,
    pub wake_evicts: bool,
    pub wake_region: bool,
    pub remember_snoop_transport: bool,
}

impl Default for Action {
    fn default() -> Self {
        Self::new(ActionKind::NoAction, 0)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(front) = &self.front {
            write!(f, " front={front}")?;
            if self.front_to_i {
                write!(f, "(I)")?;
            }
        }
        if let Some(back) = &self.back {
            write!(f, " back={back}")?;
        }
        write!(f, " data={} tag={}", self.requires_data, self.requires_tag)
    }
}

impl Action {
    #[must_use]
    pub fn new(kind: ActionKind, requires_data: u32) -> Self {
        Self {
            kind,
            front: None,
            back: None,
            front_to_d: true,
            front_to_i: false,
            requires_data,
            requires_tag: 1,
            wake_snoops: false,
            wake_evicts: false,
            wake_region: false,
            remember_snoop_transport: true,
        }
    }

    #[must_use]
    pub fn no_action() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_front(mut self, transport: Transport) -> Self {
        self.front = Some(transport);
        self
    }

    #[must_use]
    pub fn with_back(mut self, transport: Transport) -> Self {
        self.back = Some(transport);
        self
    }

    /// Route the front message to the instruction side only.
    #[must_use]
    pub fn to_icache(mut self) -> Self {
        self.front_to_d = false;
        self.front_to_i = true;
        self
    }

    #[must_use]
    pub fn is(&self, kind: ActionKind) -> bool {
        self.kind == kind
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, ActionKind};
    use crate::maf::WaitState;
    use crate::message::{Message, MessageKind};

    #[test]
    fn test_defaults() {
        let action = Action::new(ActionKind::ReplyAndRemoveMaf, 1);
        assert!(action.front_to_d);
        assert!(!action.front_to_i);
        assert_eq!(action.requires_tag, 1);
        assert!(action.remember_snoop_transport);
        assert!(action.front.is_none() && action.back.is_none());
        assert_eq!(Action::no_action().kind, ActionKind::NoAction);
    }

    #[test]
    fn test_front_routing() {
        let reply = Message::new(MessageKind::FetchReply, 0x40).into();
        let action = Action::new(ActionKind::ReplyAndRemoveMaf, 1)
            .with_front(reply)
            .to_icache();
        assert!(!action.front_to_d);
        assert!(action.front_to_i);
        assert_eq!(
            action.to_string(),
            "ReplyAndRemoveMaf front=FetchReply(0x40, core=0)(I) data=1 tag=1"
        );
    }

    #[test]
    fn test_blocked_state() {
        assert_eq!(
            ActionKind::InsertMafWaitSnoop.blocked_state(),
            Some(WaitState::WaitSnoop)
        );
        assert_eq!(ActionKind::InsertMafWaitResponse.blocked_state(), None);
        assert_eq!(ActionKind::Send.blocked_state(), None);
    }
}
