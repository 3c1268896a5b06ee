//! Unit tests for security group reconciliation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::consts::*;
    use crate::error::ControllerError;
    use crate::test_utils::*;
    use azure_client::{
        MockAzureClient, SecurityRule, SecurityRuleAccess, SecurityRuleDirection, SecurityRuleProperties,
        SecurityRuleProtocol,
    };

    fn rules(mock: &MockAzureClient) -> Vec<SecurityRule> {
        mock.security_group(TEST_RESOURCE_GROUP, TEST_SECURITY_GROUP)
            .unwrap()
            .properties
            .security_rules
    }

    fn rule<'a>(rules: &'a [SecurityRule], name: &str) -> &'a SecurityRule {
        rules
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("rule {} not found in {:?}", name, rules))
    }

    fn foreign_rule(name: &str, priority: i32) -> SecurityRule {
        SecurityRule {
            id: None,
            name: name.to_string(),
            etag: None,
            properties: SecurityRuleProperties {
                protocol: SecurityRuleProtocol::Tcp,
                source_port_range: Some("*".to_string()),
                destination_port_range: Some("22".to_string()),
                source_address_prefix: Some("*".to_string()),
                source_address_prefixes: Vec::new(),
                destination_address_prefix: Some("*".to_string()),
                destination_address_prefixes: Vec::new(),
                access: SecurityRuleAccess::Allow,
                priority,
                direction: SecurityRuleDirection::Inbound,
                description: None,
            },
        }
    }

    #[tokio::test]
    async fn test_external_service_opens_port_to_internet() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        let props = &rule(&rules, "default_web-TCP-80-Internet").properties;
        assert_eq!(props.source_address_prefix.as_deref(), Some(INTERNET_SOURCE));
        assert_eq!(props.destination_address_prefix.as_deref(), Some("20.0.0.1"));
        assert_eq!(props.destination_port_range.as_deref(), Some("80"));
        assert_eq!(props.access, SecurityRuleAccess::Allow);
        assert_eq!(props.priority, SECURITY_RULE_PRIORITY_MIN);

        // Nothing to do the second time
        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        assert_eq!(mock.call_count("create_or_update_security_group"), 1);
    }

    #[tokio::test]
    async fn test_priorities_skip_taken_values() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let mut nsg = mock.security_group(TEST_RESOURCE_GROUP, TEST_SECURITY_GROUP).unwrap();
        nsg.properties.security_rules.push(foreign_rule("allow-ssh", SECURITY_RULE_PRIORITY_MIN));
        mock.add_security_group(TEST_RESOURCE_GROUP, nsg);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());

        for (name, ip) in [("a", "20.0.0.1"), ("b", "20.0.0.2")] {
            let service = create_test_service(name, &[]);
            reconciler
                .reconcile_security_group(&service, Some(ip), Some(TEST_CLUSTER), true)
                .await
                .unwrap();
        }

        let rules = rules(&mock);
        let mut priorities: Vec<i32> = rules.iter().map(|r| r.properties.priority).collect();
        priorities.sort();
        assert_eq!(
            priorities,
            vec![SECURITY_RULE_PRIORITY_MIN, SECURITY_RULE_PRIORITY_MIN + 1, SECURITY_RULE_PRIORITY_MIN + 2]
        );
        assert_eq!(rule(&rules, "allow-ssh").properties.priority, SECURITY_RULE_PRIORITY_MIN);
    }

    #[tokio::test]
    async fn test_source_ranges_of_the_service_family_and_deny_all() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let mut service = create_test_service("web", &[(ANNOTATION_DENY_ALL_EXCEPT_SOURCE_RANGES, "true")]);
        service.source_ranges = vec!["10.1.0.0/16".to_string(), "fd00::/64".to_string()];

        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["default_web-TCP-80-10.1.0.0_16", "default_web-TCP-80-deny_all"]);

        let allow = &rule(&rules, "default_web-TCP-80-10.1.0.0_16").properties;
        assert_eq!(allow.source_address_prefix.as_deref(), Some("10.1.0.0/16"));
        let deny = &rule(&rules, "default_web-TCP-80-deny_all").properties;
        assert_eq!(deny.access, SecurityRuleAccess::Deny);
        assert_eq!(deny.source_address_prefix.as_deref(), Some("*"));
        assert_ne!(allow.priority, deny.priority);
    }

    #[tokio::test]
    async fn test_allowed_service_tags_replace_internet() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_ALLOWED_SERVICE_TAGS, "AzureFrontDoor.Backend")]);

        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].properties.source_address_prefix.as_deref(),
            Some("AzureFrontDoor.Backend")
        );
    }

    #[tokio::test]
    async fn test_changed_address_replaces_rule_in_place() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&service, Some("20.0.0.9"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].properties.destination_address_prefix.as_deref(), Some("20.0.0.9"));
        assert_eq!(rules[0].properties.priority, SECURITY_RULE_PRIORITY_MIN);
    }

    #[tokio::test]
    async fn test_shared_rule_merges_and_releases_destinations() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let shared = [(ANNOTATION_SHARED_SECURITY_RULE, "true")];
        let a = create_test_service("a", &shared);
        let b = create_test_service("b", &shared);

        reconciler
            .reconcile_security_group(&a, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&b, Some("20.0.0.2"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        let props = &rule(&rules, "shared-TCP-80-Internet").properties;
        assert_eq!(props.destination_address_prefix, None);
        assert_eq!(props.destination_address_prefixes, vec!["20.0.0.1", "20.0.0.2"]);

        reconciler
            .reconcile_security_group(&a, Some("20.0.0.1"), None, false)
            .await
            .unwrap();
        let rules = self::rules(&mock);
        let props = &rule(&rules, "shared-TCP-80-Internet").properties;
        assert_eq!(props.destination_address_prefix.as_deref(), Some("20.0.0.2"));

        reconciler
            .reconcile_security_group(&b, Some("20.0.0.2"), None, false)
            .await
            .unwrap();
        assert!(self::rules(&mock).is_empty());
    }

    #[tokio::test]
    async fn test_deletion_removes_only_service_rules() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let mut nsg = mock.security_group(TEST_RESOURCE_GROUP, TEST_SECURITY_GROUP).unwrap();
        nsg.properties.security_rules.push(foreign_rule("allow-ssh", 100));
        mock.add_security_group(TEST_RESOURCE_GROUP, nsg);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), None, false)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "allow-ssh");
    }

    #[tokio::test]
    async fn test_missing_security_group_is_a_config_error() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        let err = reconciler
            .reconcile_security_group(&service, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_shared_rule_drops_previous_address_on_change() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let shared = [(ANNOTATION_SHARED_SECURITY_RULE, "true")];
        let mut a = create_test_service("a", &shared);
        let b = create_test_service("b", &shared);

        reconciler
            .reconcile_security_group(&a, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&b, Some("20.0.0.2"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        a.ingress_ips = vec!["20.0.0.1".to_string()];
        reconciler
            .reconcile_security_group(&a, Some("20.0.0.9"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        let props = &rule(&rules, "shared-TCP-80-Internet").properties;
        assert_eq!(props.destination_address_prefixes, vec!["20.0.0.2", "20.0.0.9"]);

        // Deleting with the new address published releases it and keeps the other Service
        a.ingress_ips = vec!["20.0.0.9".to_string()];
        reconciler.reconcile_security_group(&a, None, None, false).await.unwrap();
        let rules = self::rules(&mock);
        let props = &rule(&rules, "shared-TCP-80-Internet").properties;
        assert_eq!(props.destination_address_prefix.as_deref(), Some("20.0.0.2"));
    }

    #[tokio::test]
    async fn test_service_with_lookalike_name_keeps_its_rules() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let web = create_test_service("web", &[]);
        let lookalike = create_test_service("web-tcp-80", &[]);

        reconciler
            .reconcile_security_group(&lookalike, Some("20.0.0.5"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&web, Some("20.0.0.1"), Some(TEST_CLUSTER), true)
            .await
            .unwrap();
        reconciler
            .reconcile_security_group(&web, Some("20.0.0.1"), None, false)
            .await
            .unwrap();

        let rules = rules(&mock);
        assert_eq!(rules.len(), 1);
        let kept = &rule(&rules, "default_web-tcp-80-TCP-80-Internet").properties;
        assert_eq!(kept.destination_address_prefix.as_deref(), Some("20.0.0.5"));
    }
}
