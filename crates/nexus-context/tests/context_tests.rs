#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use nexus_audit::{AuditKind, AuditLog};
    use nexus_config::{PermissionsConfig, RegistryConfig, RouterConfig};
    use nexus_context::mock::MockProvider;
    use nexus_context::*;
    use nexus_core::*;
    use serde_json::{Map, Value, json};
    use std::sync::Arc;

    struct Fixture {
        audit: Arc<AuditLog>,
        registry: Arc<ProviderRegistry>,
        guard: Arc<PermissionGuard>,
        router: ContextRouter,
    }

    fn fixture(rules: Vec<PermissionRule>) -> Fixture {
        let audit = Arc::new(AuditLog::new(10_000));
        let registry = Arc::new(ProviderRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&audit),
            EventBus::default(),
        ));
        let perms = PermissionsConfig {
            rules,
            ..Default::default()
        };
        let guard = Arc::new(PermissionGuard::new(&perms, Arc::clone(&audit)).unwrap());
        let router = ContextRouter::new(
            RouterConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&guard),
            Arc::clone(&audit),
        );
        Fixture {
            audit,
            registry,
            guard,
            router,
        }
    }

    fn payload(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn descriptor(id: &str, types: &[&str], tier: TrustTier) -> ProviderDescriptor {
        ProviderDescriptor::new(id, types.iter().copied(), tier, 5)
    }

    fn register_mock(f: &Fixture, id: &str, types: &[&str], tier: TrustTier, mock: MockProvider) {
        f.registry
            .register_with_source(descriptor(id, types, tier), Arc::new(mock))
            .unwrap();
    }

    fn permission_denies(audit: &AuditLog) -> usize {
        audit
            .entries_of(AuditKind::PermissionCheck)
            .iter()
            .filter(|e| e.payload["allowed"] == json!(false))
            .count()
    }

    // ── Scenario: no rule, no context ──────────────────────────

    #[tokio::test]
    async fn test_unpermitted_consumer_gets_no_accessible_context() {
        let f = fixture(vec![]);
        let mock = MockProvider::new("fs-watcher")
            .with_record(ContextRecord::new("filesystem", payload(json!({ "path": "/home" }))));
        register_mock(&f, "fs-watcher", &["filesystem"], TrustTier::System, mock);

        let result = f
            .router
            .gather(&ContextRequest::new("shell-ui", ["filesystem"]))
            .await;
        assert!(matches!(result, Err(NexusError::NoAccessibleContext)));
        assert_eq!(permission_denies(&f.audit), 1);
        assert!(f.audit.entries_of(AuditKind::ContextGathered).is_empty());
    }

    #[tokio::test]
    async fn test_no_providers_is_no_accessible_context() {
        let f = fixture(vec![PermissionRule::allow("r", "ui", "*", "*")]);
        let result = f.router.gather(&ContextRequest::new("ui", ["network"])).await;
        assert!(matches!(result, Err(NexusError::NoAccessibleContext)));
    }

    #[tokio::test]
    async fn test_empty_type_list_is_config_error() {
        let f = fixture(vec![]);
        let err = f
            .router
            .gather(&ContextRequest::new("ui", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }

    // ── Gathering ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_gather_ranks_and_truncates() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        let now = Utc::now();
        let fresh = ContextRecord::new("filesystem", payload(json!({ "path": "/home/ada/report.txt" })))
            .produced_at(now);
        let stale = ContextRecord::new("filesystem", payload(json!({ "path": "/var/log/syslog" })))
            .produced_at(now - Duration::hours(2));
        let other = ContextRecord::new("filesystem", payload(json!({ "path": "/tmp/x" })))
            .produced_at(now - Duration::minutes(30));
        register_mock(
            &f,
            "fs",
            &["filesystem"],
            TrustTier::System,
            MockProvider::new("fs")
                .with_record(stale)
                .with_record(fresh)
                .with_record(other),
        );

        let resp = f
            .router
            .gather(&ContextRequest::new("ui", ["filesystem"]).with_limit(2))
            .await
            .unwrap();
        assert!(!resp.partial);
        assert_eq!(resp.records.len(), 2);
        assert_eq!(resp.records[0].payload["path"], "/home/ada/report.txt");
        assert!(resp.records[0].relevance >= resp.records[1].relevance);
        assert!(resp.records.iter().all(|r| r.provider_id == "fs"));
    }

    #[tokio::test]
    async fn test_query_overlap_lifts_matching_records() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        let now = Utc::now();
        register_mock(
            &f,
            "net",
            &["network"],
            TrustTier::Verified,
            MockProvider::new("net")
                .with_record(
                    ContextRecord::new("network", payload(json!({ "iface": "eth0", "state": "up" })))
                        .produced_at(now),
                )
                .with_record(
                    ContextRecord::new("network", payload(json!({ "iface": "wlan0", "ssid": "office wifi" })))
                        .produced_at(now - Duration::seconds(30)),
                ),
        );

        let resp = f
            .router
            .gather(&ContextRequest::new("ui", ["network"]).with_query("office wifi"))
            .await
            .unwrap();
        assert_eq!(resp.records[0].payload["iface"], "wlan0");
    }

    #[tokio::test]
    async fn test_slow_and_failing_providers_yield_partial() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        register_mock(
            &f,
            "good",
            &["system"],
            TrustTier::System,
            MockProvider::new("good")
                .with_record(ContextRecord::new("system", payload(json!({ "load": 0.4 })))),
        );
        register_mock(
            &f,
            "slow",
            &["system"],
            TrustTier::System,
            MockProvider::new("slow").with_delay(std::time::Duration::from_secs(2)),
        );
        register_mock(
            &f,
            "broken",
            &["system"],
            TrustTier::System,
            MockProvider::new("broken").with_error("disk on fire"),
        );

        let started = std::time::Instant::now();
        let resp = f
            .router
            .gather(&ContextRequest::new("ui", ["system"]))
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert!(resp.partial);
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.failed_providers, vec!["broken".to_string(), "slow".to_string()]);

        let broken = f.registry.get("broken").unwrap();
        assert_eq!(broken.stats.failures, 1);
        assert_eq!(broken.stats.last_error.as_deref().map(|e| e.contains("disk on fire")), Some(true));
    }

    #[tokio::test]
    async fn test_repeated_failures_demote_provider() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        register_mock(&f, "flaky", &["system"], TrustTier::ThirdParty, MockProvider::new("flaky").with_error("boom"));
        register_mock(
            &f,
            "steady",
            &["system"],
            TrustTier::System,
            MockProvider::new("steady").with_record(ContextRecord::new("system", Map::new())),
        );

        for _ in 0..3 {
            f.router.gather(&ContextRequest::new("ui", ["system"])).await.unwrap();
        }
        assert_eq!(f.registry.get("flaky").unwrap().health, HealthStatus::Degraded);
        assert_eq!(f.registry.list("system").len(), 1);
        assert_eq!(f.audit.entries_of(AuditKind::ProviderDegraded).len(), 1);

        let resp = f.router.gather(&ContextRequest::new("ui", ["system"])).await.unwrap();
        assert!(!resp.partial);
    }

    #[tokio::test]
    async fn test_denied_candidates_are_dropped_not_fatal() {
        let f = fixture(vec![
            PermissionRule::allow("fs", "ui", "fs", "*"),
            PermissionRule::deny("no-browser", "ui", "browser", "*"),
        ]);
        register_mock(
            &f,
            "fs",
            &["activity"],
            TrustTier::System,
            MockProvider::new("fs").with_record(ContextRecord::new("activity", Map::new())),
        );
        register_mock(
            &f,
            "browser",
            &["activity"],
            TrustTier::ThirdParty,
            MockProvider::new("browser").with_record(ContextRecord::new("activity", Map::new())),
        );
        let resp = f.router.gather(&ContextRequest::new("ui", ["activity"])).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.records[0].provider_id, "fs");
        assert_eq!(permission_denies(&f.audit), 1);
    }

    // ── Clearance and filters ──────────────────────────────────

    #[tokio::test]
    async fn test_clearance_withholds_sensitive_records() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        register_mock(
            &f,
            "health",
            &["wellbeing"],
            TrustTier::Verified,
            MockProvider::new("health")
                .with_record(ContextRecord::new("wellbeing", Map::new()).with_sensitivity(Sensitivity::Public))
                .with_record(ContextRecord::new("wellbeing", Map::new()).with_sensitivity(Sensitivity::Sensitive)),
        );

        let resp = f.router.gather(&ContextRequest::new("ui", ["wellbeing"])).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.records[0].sensitivity, Sensitivity::Public);

        f.guard.set_clearance("admin", "ui", Sensitivity::Sensitive).unwrap();
        let resp = f.router.gather(&ContextRequest::new("ui", ["wellbeing"])).await.unwrap();
        assert_eq!(resp.records.len(), 2);
        assert_eq!(f.audit.entries_of(AuditKind::ClearanceMutated).len(), 1);
    }

    #[tokio::test]
    async fn test_tag_and_time_filters() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        let now = Utc::now();
        register_mock(
            &f,
            "fs",
            &["filesystem"],
            TrustTier::System,
            MockProvider::new("fs")
                .with_record(ContextRecord::new("filesystem", Map::new()).with_tags(["disk"]).produced_at(now))
                .with_record(
                    ContextRecord::new("filesystem", Map::new())
                        .with_tags(["disk"])
                        .produced_at(now - Duration::days(1)),
                )
                .with_record(ContextRecord::new("filesystem", Map::new()).with_tags(["mount"]).produced_at(now)),
        );
        let mut req = ContextRequest::new("ui", ["filesystem"]);
        req.filters.tags = vec!["disk".into()];
        req.filters.since = Some(now - Duration::hours(1));
        let resp = f.router.gather(&req).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.records[0].tags, vec!["disk".to_string()]);
    }

    // ── Push cache ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_pushed_records_are_served_and_superseded() {
        let f = fixture(vec![PermissionRule::allow("ui-all", "ui", "*", "*")]);
        f.registry
            .register(descriptor("net", &["network"], TrustTier::Verified))
            .unwrap();

        let now = Utc::now();
        let first = ContextRecord::new("network", payload(json!({ "state": "down" }))).produced_at(now);
        let newer = ContextRecord::new("network", payload(json!({ "state": "up" })))
            .produced_at(now + Duration::seconds(1));
        assert!(f.router.push("net", first.clone()).unwrap());
        assert!(f.router.push("net", newer).unwrap());
        assert!(!f.router.push("net", first).unwrap());

        let resp = f.router.gather(&ContextRequest::new("ui", ["network"])).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert_eq!(resp.records[0].payload["state"], "up");
        assert_eq!(f.audit.entries_of(AuditKind::ContextPushed).len(), 3);
    }

    #[test]
    fn test_push_rejects_undeclared_type_and_unknown_provider() {
        let f = fixture(vec![]);
        f.registry
            .register(descriptor("net", &["network"], TrustTier::Verified))
            .unwrap();
        let err = f
            .router
            .push("net", ContextRecord::new("calendar", Map::new()))
            .unwrap_err();
        assert!(matches!(err, NexusError::UndeclaredContextType { .. }));
        let err = f
            .router
            .push("ghost", ContextRecord::new("network", Map::new()))
            .unwrap_err();
        assert!(matches!(err, NexusError::ProviderNotFound(_)));
    }

    #[test]
    fn test_pushed_record_ttl_and_purge() {
        let f = fixture(vec![]);
        f.registry
            .register(descriptor("net", &["network"], TrustTier::Verified))
            .unwrap();
        let mut rec = ContextRecord::new("network", Map::new());
        rec.ttl_secs = Some(1);
        f.router.push("net", rec).unwrap();
        assert_eq!(f.router.cached_records(), 1);
        assert_eq!(f.router.evict_expired(Utc::now() + Duration::seconds(2)), 1);

        f.router.push("net", ContextRecord::new("network", Map::new())).unwrap();
        assert_eq!(f.router.purge_provider("net"), 1);
    }

    #[test]
    fn test_push_rejects_unbounded_ttl() {
        let f = fixture(vec![]);
        f.registry
            .register(descriptor("net", &["network"], TrustTier::Verified))
            .unwrap();
        let mut rec = ContextRecord::new("network", Map::new());
        rec.ttl_secs = Some(1_000_000_000_000_000);
        let err = f.router.push("net", rec).unwrap_err();
        assert_eq!(err.status_hint(), 400);
        assert_eq!(f.router.cached_records(), 0);

        let mut rec = ContextRecord::new("network", Map::new());
        rec.ttl_secs = Some(MAX_SPAN_SECS);
        assert!(f.router.push("net", rec).unwrap());
    }

    // ── Registry liveness ──────────────────────────────────────

    #[test]
    fn test_sweep_marks_unreachable_then_purges() {
        let f = fixture(vec![]);
        f.registry
            .register(descriptor("fs-watcher", &["filesystem"], TrustTier::System))
            .unwrap();
        let t0 = Utc::now();

        // Two missed intervals: still healthy.
        let report = f.registry.sweep(t0 + Duration::seconds(10)).unwrap();
        assert!(report.unreachable.is_empty());
        assert_eq!(f.registry.list("filesystem").len(), 1);

        let report = f.registry.sweep(t0 + Duration::seconds(16)).unwrap();
        assert_eq!(report.unreachable, vec!["fs-watcher".to_string()]);
        assert!(f.registry.list("filesystem").is_empty());
        assert_eq!(f.registry.get("fs-watcher").unwrap().health, HealthStatus::Unreachable);

        // Grace window is 300s from the moment it went unreachable.
        let report = f.registry.sweep(t0 + Duration::seconds(200)).unwrap();
        assert!(report.purged.is_empty());
        let report = f.registry.sweep(t0 + Duration::seconds(400)).unwrap();
        assert_eq!(report.purged, vec!["fs-watcher".to_string()]);
        assert!(f.registry.get("fs-watcher").is_none());

        assert_eq!(f.audit.entries_of(AuditKind::ProviderUnreachable).len(), 1);
        assert_eq!(f.audit.entries_of(AuditKind::ProviderPurged).len(), 1);
    }

    #[test]
    fn test_unbounded_heartbeat_is_rejected_and_sweep_saturates() {
        let f = fixture(vec![]);
        let huge = ProviderDescriptor::new("slow", ["filesystem"], TrustTier::System, 4_000_000_000_000_000);
        assert!(matches!(
            f.registry.register(huge),
            Err(NexusError::MalformedDescriptor(_))
        ));

        let audit = Arc::new(AuditLog::new(1000));
        let registry = ProviderRegistry::new(
            RegistryConfig {
                missed_heartbeat_threshold: u32::MAX,
                ..Default::default()
            },
            audit,
            EventBus::default(),
        );
        registry
            .register(ProviderDescriptor::new("slow", ["filesystem"], TrustTier::System, MAX_SPAN_SECS))
            .unwrap();
        let report = registry.sweep(Utc::now() + Duration::days(365)).unwrap();
        assert!(report.unreachable.is_empty());
        assert_eq!(registry.list("filesystem").len(), 1);
    }

    #[test]
    fn test_unreachable_provider_may_reregister_and_heartbeat_recovers() {
        let f = fixture(vec![]);
        let d = descriptor("fs-watcher", &["filesystem"], TrustTier::System);
        f.registry.register(d.clone()).unwrap();
        f.registry.sweep(Utc::now() + Duration::seconds(60)).unwrap();

        f.registry.heartbeat("fs-watcher").unwrap();
        assert_eq!(f.registry.list("filesystem").len(), 1);

        f.registry.sweep(Utc::now() + Duration::seconds(60)).unwrap();
        f.registry.register(d).unwrap();
        assert_eq!(f.registry.get("fs-watcher").unwrap().health, HealthStatus::Healthy);
    }

    #[test]
    fn test_register_and_deregister_are_audited() {
        let f = fixture(vec![]);
        f.registry
            .register(descriptor("fs", &["filesystem"], TrustTier::System))
            .unwrap();
        f.registry.deregister("fs").unwrap();
        assert!(matches!(f.registry.deregister("fs"), Err(NexusError::ProviderNotFound(_))));
        assert_eq!(f.audit.entries_of(AuditKind::ProviderRegistered).len(), 1);
        assert_eq!(f.audit.entries_of(AuditKind::ProviderDeregistered).len(), 1);
    }

    #[test]
    fn test_source_id_must_match_descriptor() {
        let f = fixture(vec![]);
        let err = f
            .registry
            .register_with_source(
                descriptor("fs", &["filesystem"], TrustTier::System),
                Arc::new(MockProvider::new("other")),
            )
            .unwrap_err();
        assert!(matches!(err, NexusError::MalformedDescriptor(_)));
    }

    // ── Permission guard ───────────────────────────────────────

    #[test]
    fn test_rate_limited_checks_are_consistent_until_boundary() {
        let f = fixture(vec![
            PermissionRule::allow("limited", "ui", "fs", "filesystem").with_rate_limit(3, 60),
        ]);
        let t0 = Utc::now();
        let mut answers = Vec::new();
        for i in 0..10 {
            let d = f
                .guard
                .check_at("ui", "fs", "filesystem", t0 + Duration::seconds(i))
                .unwrap();
            answers.push(d.is_allowed());
        }
        assert_eq!(answers, vec![true, true, true, false, false, false, false, false, false, false]);

        let d = f
            .guard
            .check_at("ui", "fs", "filesystem", t0 + Duration::seconds(59))
            .unwrap();
        assert_eq!(
            d,
            AccessDecision::Deny {
                reason: RATE_LIMITED.into(),
                rule_id: Some("limited".into())
            }
        );
        let d = f
            .guard
            .check_at("ui", "fs", "filesystem", t0 + Duration::seconds(60))
            .unwrap();
        assert!(d.is_allowed());
    }

    #[test]
    fn test_unbounded_rate_window_is_rejected() {
        let f = fixture(vec![]);
        let rule = PermissionRule::allow("huge", "ui", "fs", "filesystem").with_rate_limit(1, u64::MAX / 2);
        let err = f.guard.add_rule("admin", rule).unwrap_err();
        assert!(err.is_config_error());
        assert!(f.guard.rules().is_empty());
        assert!(!f.guard.check("ui", "fs", "filesystem").unwrap().is_allowed());
    }

    #[test]
    fn test_every_check_is_audited_with_rule_id() {
        let f = fixture(vec![PermissionRule::allow("ui-fs", "ui", "fs", "*")]);
        f.guard.check("ui", "fs", "filesystem").unwrap();
        f.guard.check("ui", "net", "network").unwrap();
        let entries = f.audit.entries_of(AuditKind::PermissionCheck);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload["rule_id"], "ui-fs");
        assert_eq!(entries[1].payload["rule_id"], Value::Null);
        assert_eq!(entries[1].payload["allowed"], false);
    }

    #[test]
    fn test_rule_mutations_are_audited_and_validated() {
        let f = fixture(vec![]);
        f.guard
            .add_rule("admin", PermissionRule::allow("r1", "ui", "*", "network"))
            .unwrap();
        assert!(f.guard.add_rule("admin", PermissionRule::allow("r1", "ui", "*", "x")).is_err());
        assert!(f.guard.add_rule("admin", PermissionRule::allow("r2", "*", "*", "x")).is_err());
        assert!(f.guard.check("ui", "net", "network").unwrap().is_allowed());

        f.guard.remove_rule("admin", "r1").unwrap();
        assert!(!f.guard.check("ui", "net", "network").unwrap().is_allowed());

        f.guard
            .replace_rules("admin", vec![PermissionRule::allow("r3", "ui", "net", "network")])
            .unwrap();
        assert_eq!(f.guard.rules().len(), 1);

        let mutations = f.audit.entries_of(AuditKind::PermissionMutated);
        assert_eq!(mutations.len(), 3);
        assert_eq!(mutations[0].actor, "admin");
        assert_eq!(mutations[0].severity, Severity::Warning);
    }

    #[test]
    fn test_time_window_condition() {
        let mut rule = PermissionRule::allow("night", "backup", "fs", "*");
        rule.conditions = Some(RuleConditions {
            active_hours_utc: Some((1, 5)),
            ..Default::default()
        });
        let f = fixture(vec![rule]);
        let day = Utc::now().date_naive();
        let at = |h: u32| day.and_hms_opt(h, 0, 0).unwrap().and_utc();
        assert!(f.guard.check_at("backup", "fs", "filesystem", at(2)).unwrap().is_allowed());
        assert!(!f.guard.check_at("backup", "fs", "filesystem", at(12)).unwrap().is_allowed());
    }

    // ── Properties ─────────────────────────────────────────────

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Whatever the heartbeat history, an unreachable provider is never listed.
            #[test]
            fn prop_unreachable_never_listed(
                beats in prop::collection::vec(0i64..40, 0..8),
                sweep_at in 0i64..120,
            ) {
                let f = fixture(vec![]);
                f.registry
                    .register(descriptor("p", &["filesystem"], TrustTier::System))
                    .unwrap();
                let t0 = Utc::now();
                for b in &beats {
                    f.registry.heartbeat_at("p", t0 + Duration::seconds(*b)).unwrap();
                }
                f.registry.sweep(t0 + Duration::seconds(sweep_at)).unwrap();
                let health = f.registry.get("p").map(|p| p.health);
                let listed = f.registry.list("filesystem").iter().any(|p| p.id() == "p");
                if health == Some(HealthStatus::Unreachable) || health.is_none() {
                    prop_assert!(!listed);
                } else {
                    prop_assert!(listed);
                }
            }

            /// Inside one window a triple never flips from deny back to allow.
            #[test]
            fn prop_rate_limit_is_monotone_within_window(
                max in 1u32..6,
                offsets in prop::collection::vec(0i64..30, 1..20),
            ) {
                let f = fixture(vec![
                    PermissionRule::allow("r", "ui", "fs", "filesystem").with_rate_limit(max, 60),
                ]);
                let t0 = Utc::now();
                let mut sorted = offsets.clone();
                sorted.sort();
                let mut denied = false;
                let mut allowed = 0u32;
                for o in sorted {
                    let ok = f
                        .guard
                        .check_at("ui", "fs", "filesystem", t0 + Duration::seconds(o))
                        .unwrap()
                        .is_allowed();
                    if denied {
                        prop_assert!(!ok);
                    }
                    if ok {
                        allowed += 1;
                    } else {
                        denied = true;
                    }
                }
                prop_assert!(allowed <= max);
            }
        }
    }
}
