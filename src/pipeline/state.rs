use super::OperationKind;
use super::fault::FaultKind;

/// 单次（设备, 操作）调用的恢复状态机
///
/// `Idle -> InFlight -> Faulted -> Recovering -> InFlight ... -> Idle`，
/// 不可重试或预算耗尽时进入 `Reported`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    InFlight(OperationKind),
    Faulted(FaultKind),
    Recovering { attempt: u32 },
    Reported(FaultKind),
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::InFlight(_) => "in_flight",
            OperationState::Faulted(_) => "faulted",
            OperationState::Recovering { .. } => "recovering",
            OperationState::Reported(_) => "reported",
        }
    }

    /// 调用已结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Idle | OperationState::Reported(_))
    }

    /// 状态转移是否合法
    pub fn can_transition_to(&self, next: &OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            // 取消可以在任意未结束的状态发生
            (s, Reported(_)) if !s.is_terminal() => true,
            (Idle | Reported(_), InFlight(_)) => true,
            (InFlight(_), Idle | Faulted(_)) => true,
            (Faulted(_), Recovering { .. }) => true,
            (Recovering { .. }, InFlight(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path() {
        let path = [
            OperationState::Idle,
            OperationState::InFlight(OperationKind::SendEvent),
            OperationState::Faulted(FaultKind::TransientNetwork),
            OperationState::Recovering { attempt: 1 },
            OperationState::InFlight(OperationKind::SendEvent),
            OperationState::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_reported_paths() {
        let faulted = OperationState::Faulted(FaultKind::Quota);
        let recovering = OperationState::Recovering { attempt: 2 };
        let reported = OperationState::Reported(FaultKind::Quota);

        assert!(faulted.can_transition_to(&reported));
        assert!(recovering.can_transition_to(&reported));
        assert!(reported.is_terminal());
        assert!(!reported.can_transition_to(&OperationState::Reported(FaultKind::Unknown)));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!OperationState::Idle.can_transition_to(&OperationState::Recovering { attempt: 1 }));
        assert!(
            !OperationState::Faulted(FaultKind::Throttle)
                .can_transition_to(&OperationState::Idle)
        );
        assert_eq!(OperationState::Recovering { attempt: 1 }.as_str(), "recovering");
    }
}
