#[cfg(test)]
mod tests {
    use nexus_core::*;
    use serde_json::json;

    // ── Descriptor tests ───────────────────────────────────────

    #[test]
    fn test_descriptor_valid() {
        let d = ProviderDescriptor::new("fs", ["filesystem"], TrustTier::System, 5);
        assert!(d.validate().is_ok());
        assert!(d.context_types.contains("filesystem"));
    }

    #[test]
    fn test_descriptor_rejects_empty_types() {
        let d = ProviderDescriptor::new("fs", Vec::<String>::new(), TrustTier::System, 5);
        assert!(matches!(d.validate(), Err(NexusError::MalformedDescriptor(_))));
    }

    #[test]
    fn test_descriptor_rejects_zero_heartbeat() {
        let d = ProviderDescriptor::new("fs", ["filesystem"], TrustTier::System, 0);
        assert!(matches!(d.validate(), Err(NexusError::MalformedDescriptor(_))));
    }

    #[test]
    fn test_descriptor_rejects_unbounded_heartbeat() {
        let d = ProviderDescriptor::new("fs", ["filesystem"], TrustTier::System, 4_000_000_000_000_000);
        assert!(matches!(d.validate(), Err(NexusError::MalformedDescriptor(_))));
        let d = ProviderDescriptor::new("fs", ["filesystem"], TrustTier::System, MAX_SPAN_SECS);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_record_rejects_unbounded_ttl() {
        let mut record = ContextRecord::new("network", serde_json::Map::new());
        assert!(record.validate().is_ok());
        record.ttl_secs = Some(1_000_000_000_000_000);
        let err = record.validate().unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(err.status_hint(), 400);
    }

    #[test]
    fn test_descriptor_rejects_wildcard_id() {
        let d = ProviderDescriptor::new("*", ["filesystem"], TrustTier::System, 5);
        assert!(d.validate().is_err());
    }

    // ── Filter tests ───────────────────────────────────────────

    #[test]
    fn test_filters_match_tags_and_window() {
        let now = chrono::Utc::now();
        let rec = ContextRecord::new("filesystem", serde_json::Map::new())
            .with_tags(["disk"])
            .produced_at(now);

        let mut f = ContextFilters::default();
        assert!(f.matches(&rec));

        f.tags = vec!["net".into()];
        assert!(!f.matches(&rec));

        f.tags = vec!["net".into(), "disk".into()];
        f.since = Some(now + chrono::Duration::seconds(1));
        assert!(!f.matches(&rec));

        f.since = Some(now - chrono::Duration::seconds(1));
        f.until = Some(now);
        assert!(f.matches(&rec));
    }

    #[test]
    fn test_sensitivity_ordering() {
        assert!(Sensitivity::Public < Sensitivity::Private);
        assert!(Sensitivity::Private < Sensitivity::Sensitive);
        assert_eq!(Sensitivity::default(), Sensitivity::Public);
    }

    // ── Action tests ───────────────────────────────────────────

    #[test]
    fn test_action_validate() {
        let a = ProposedAction::new("ui", "file_op", "/tmp/x", Reversibility::Reversible, ImpactTier::Low);
        assert!(a.validate().is_ok());

        let bad = ProposedAction::new("ui", "file_op", " ", Reversibility::Reversible, ImpactTier::Low);
        assert!(matches!(bad.validate(), Err(NexusError::InvalidAction(_))));
    }

    #[test]
    fn test_retry_keeps_correlation() {
        let a = ProposedAction::new("ui", "file_op", "/tmp/x", Reversibility::Reversible, ImpactTier::Low);
        let r1 = a.retry();
        let r2 = r1.retry();
        assert_ne!(a.id, r1.id);
        assert_eq!(r1.correlation_id(), a.id);
        assert_eq!(r2.correlation_id(), a.id);
    }

    #[test]
    fn test_action_deserialize_defaults() {
        let a: ProposedAction = serde_json::from_value(json!({
            "consumer": "ui",
            "kind": "config_change",
            "target": "/etc/hosts",
            "reversibility": "partially_reversible",
            "impact": "medium"
        }))
        .unwrap();
        assert_eq!(a.reversibility, Reversibility::PartiallyReversible);
        assert!(a.parameters.is_null());
        assert_eq!(a.correlation_id(), a.id);
    }

    #[test]
    fn test_reversibility_snapshot_requirement() {
        assert!(Reversibility::Reversible.needs_snapshot());
        assert!(Reversibility::PartiallyReversible.needs_snapshot());
        assert!(!Reversibility::Irreversible.needs_snapshot());
    }

    // ── State machine tests ────────────────────────────────────

    #[test]
    fn test_state_happy_path() {
        use ActionState::*;
        let path = [Received, ContextGathered, Assessed, Executing, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_state_rejects_skips() {
        use ActionState::*;
        assert!(!Received.can_transition_to(Executing));
        assert!(!Rejected.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Cancelled));
        assert!(!RolledBack.can_transition_to(Completed));
    }

    #[test]
    fn test_state_cancellation() {
        use ActionState::*;
        assert!(AwaitingApproval.can_transition_to(Cancelled));
        assert!(Assessed.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_completed_can_roll_back() {
        assert!(ActionState::Completed.is_terminal());
        assert!(ActionState::Completed.can_transition_to(ActionState::RolledBack));
    }

    // ── Decision tests ─────────────────────────────────────────

    #[test]
    fn test_risk_factor_display() {
        let f = RiskFactor::DenyKeyword {
            keyword: "rm -rf".into(),
            weight: 0.7,
        };
        assert!(f.to_string().contains("rm -rf"));
        assert!(RiskFactor::IrreversibleNeverAuto.to_string().contains("never"));
    }

    #[test]
    fn test_risk_factor_serde_tag() {
        let f = RiskFactor::Impact {
            tier: ImpactTier::High,
            weight: 0.45,
        };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["factor"], "impact");
        assert_eq!(v["tier"], "high");
    }

    #[test]
    fn test_rollback_outcome_serde() {
        let o = RollbackOutcome::RolledBack { noop: true };
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["outcome"], "rolled_back");
        assert!(o.is_success());
        assert!(!RollbackOutcome::Failed { reason: "x".into() }.is_success());
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_status_hints() {
        assert_eq!(NexusError::AccessDenied("x".into()).status_hint(), 403);
        assert_eq!(NexusError::ProviderNotFound("x".into()).status_hint(), 404);
        assert_eq!(NexusError::DuplicateProvider("x".into()).status_hint(), 409);
        assert_eq!(NexusError::ResourceBusy("x".into()).status_hint(), 423);
        assert_eq!(NexusError::AuditHalted("x".into()).status_hint(), 503);
        assert_eq!(NexusError::Storage("x".into()).status_hint(), 500);
    }

    #[test]
    fn test_config_error_classification() {
        assert!(NexusError::MalformedDescriptor("x".into()).is_config_error());
        assert!(!NexusError::NoAccessibleContext.is_config_error());
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::ProviderRegistered {
            provider_id: "fs".into(),
        });
        match rx.recv().await.unwrap() {
            Event::ProviderRegistered { provider_id } => assert_eq!(provider_id, "fs"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(Event::Shutdown);
    }
}
