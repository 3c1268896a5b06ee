//! Unit tests for public IP ownership and lifecycle

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::consts::*;
    use crate::error::ControllerError;
    use crate::test_utils::*;
    use azure_client::{IPVersion, MockAzureClient, PublicIPAddress, PublicIPAddressDnsSettings, SkuName};

    fn tagged_public_ip(name: &str, address: &str, tags: &[(&str, &str)]) -> PublicIPAddress {
        let mut pip = create_test_public_ip(name, Some(address));
        pip.tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        pip
    }

    #[tokio::test]
    async fn test_determine_public_ip_name() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        mock.add_public_ip(TEST_RESOURCE_GROUP, create_test_public_ip("byo", Some("1.2.3.4")));
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());

        let service = create_test_service("web", &[]);
        assert_eq!(
            reconciler.determine_public_ip_name(&service).await.unwrap(),
            ("pip-default_web".to_string(), false)
        );

        let mut v6 = create_test_service("web", &[]);
        v6.ipv6 = true;
        assert_eq!(
            reconciler.determine_public_ip_name(&v6).await.unwrap().0,
            format!("pip-default_web{}", IPV6_SUFFIX)
        );

        let named = create_test_service("web", &[(ANNOTATION_PIP_NAME, "my-ip")]);
        assert_eq!(
            reconciler.determine_public_ip_name(&named).await.unwrap(),
            ("my-ip".to_string(), true)
        );

        let mut by_address = create_test_service("web", &[]);
        by_address.load_balancer_ip = Some("1.2.3.4".to_string());
        assert_eq!(
            reconciler.determine_public_ip_name(&by_address).await.unwrap(),
            ("byo".to_string(), true)
        );

        by_address.load_balancer_ip = Some("5.6.7.8".to_string());
        let err = reconciler.determine_public_ip_name(&by_address).await.unwrap_err();
        assert!(matches!(err, ControllerError::PublicIpNotFound(_)));
    }

    #[tokio::test]
    async fn test_public_ip_ownership() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);
        let named = create_test_service("web", &[(ANNOTATION_PIP_NAME, "byo")]);

        let untagged = create_test_public_ip("byo", Some("1.2.3.4"));
        assert_eq!(reconciler.public_ip_ownership(&service, &untagged), (false, true));
        assert_eq!(reconciler.public_ip_ownership(&named, &untagged), (true, true));

        let owned = tagged_public_ip(
            "pip-default_web",
            "20.0.0.1",
            &[(SERVICE_TAG_KEY, "default/a,default/web"), (CLUSTER_NAME_TAG_KEY, TEST_CLUSTER)],
        );
        assert_eq!(reconciler.public_ip_ownership(&service, &owned), (true, false));

        let other_cluster = tagged_public_ip(
            "pip-default_web",
            "20.0.0.1",
            &[(SERVICE_TAG_KEY, "default/web"), (CLUSTER_NAME_TAG_KEY, "other")],
        );
        assert_eq!(reconciler.public_ip_ownership(&service, &other_cluster), (false, false));

        let someone_else = tagged_public_ip("byo", "20.0.0.1", &[(SERVICE_TAG_KEY, "default/other")]);
        assert_eq!(reconciler.public_ip_ownership(&service, &someone_else), (false, false));
        assert_eq!(reconciler.public_ip_ownership(&named, &someone_else), (true, false));
    }

    #[tokio::test]
    async fn test_new_public_ip_is_tagged_and_static() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_DNS_LABEL_NAME, "web-label")]);

        let pip = reconciler
            .reconcile_public_ips(&service, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pip.name, "pip-default_web");
        assert_eq!(pip.properties.ip_address.as_deref(), Some("20.0.0.1"));
        assert_eq!(pip.sku.as_ref().unwrap().name, SkuName::Standard);
        assert_eq!(pip.tags.get(SERVICE_TAG_KEY).map(String::as_str), Some("default/web"));
        assert_eq!(pip.tags.get(CLUSTER_NAME_TAG_KEY).map(String::as_str), Some(TEST_CLUSTER));
        assert_eq!(
            pip.tags.get(SERVICE_USING_DNS_TAG_KEY).map(String::as_str),
            Some("default/web")
        );
        assert_eq!(
            pip.properties.dns_settings.as_ref().unwrap().fqdn.as_deref(),
            Some("web-label.eastus.cloudapp.azure.com")
        );

        // Converged: no further writes
        mock.clear_calls();
        reconciler.reconcile_public_ips(&service, true).await.unwrap();
        assert_eq!(mock.call_count("create_or_update_public_ip"), 0);
    }

    #[tokio::test]
    async fn test_dns_label_held_by_another_service_is_refused() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let mut pip = tagged_public_ip(
            "shared",
            "20.0.0.7",
            &[(SERVICE_TAG_KEY, "default/other"), (SERVICE_USING_DNS_TAG_KEY, "default/other")],
        );
        pip.properties.dns_settings = Some(PublicIPAddressDnsSettings {
            domain_name_label: Some("other-label".to_string()),
            fqdn: None,
        });
        mock.add_public_ip(TEST_RESOURCE_GROUP, pip);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());

        let service = create_test_service("web", &[(ANNOTATION_PIP_NAME, "shared"), (ANNOTATION_DNS_LABEL_NAME, "mine")]);
        let err = reconciler
            .ensure_public_ip_exists(&service, "shared", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::DnsLabelInUse(_)));
        assert_eq!(mock.call_count("create_or_update_public_ip"), 0);

        // Asking for the label the IP already carries is fine
        let same = create_test_service("web", &[(ANNOTATION_PIP_NAME, "shared"), (ANNOTATION_DNS_LABEL_NAME, "other-label")]);
        let pip = reconciler.ensure_public_ip_exists(&same, "shared", true).await.unwrap();
        assert_eq!(
            pip.tags.get(SERVICE_USING_DNS_TAG_KEY).map(String::as_str),
            Some("default/other")
        );
        assert_eq!(pip.tags.get(SERVICE_TAG_KEY).map(String::as_str), Some("default/other,default/web"));
    }

    #[tokio::test]
    async fn test_missing_named_public_ip_is_an_error() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_PIP_NAME, "absent")]);

        let err = reconciler.reconcile_public_ips(&service, true).await.unwrap_err();
        assert!(matches!(err, ControllerError::PublicIpNotFound(_)));
        assert_eq!(mock.call_count("create_or_update_public_ip"), 0);
    }

    #[tokio::test]
    async fn test_user_assigned_public_ip_is_never_changed() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        mock.add_public_ip(TEST_RESOURCE_GROUP, create_test_public_ip("byo", Some("1.2.3.4")));
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_PIP_NAME, "byo")]);

        let pip = reconciler
            .reconcile_public_ips(&service, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pip.properties.ip_address.as_deref(), Some("1.2.3.4"));
        assert!(pip.tags.is_empty());

        reconciler.reconcile_public_ips(&service, false).await.unwrap();
        assert_eq!(mock.call_count("create_or_update_public_ip"), 0);
        assert_eq!(mock.call_count("delete_public_ip"), 0);
        assert!(mock.public_ip(TEST_RESOURCE_GROUP, "byo").is_some());
    }

    #[tokio::test]
    async fn test_owned_public_ip_is_deleted_on_release() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        reconciler.reconcile_public_ips(&service, true).await.unwrap();
        assert!(mock.public_ip(TEST_RESOURCE_GROUP, "pip-default_web").is_some());

        reconciler.reconcile_public_ips(&service, false).await.unwrap();
        assert!(mock.public_ip(TEST_RESOURCE_GROUP, "pip-default_web").is_none());
    }

    #[tokio::test]
    async fn test_shared_public_ip_keeps_remaining_owner() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        mock.add_public_ip(
            TEST_RESOURCE_GROUP,
            tagged_public_ip(
                "shared",
                "20.0.0.7",
                &[(SERVICE_TAG_KEY, "default/a,default/web"), (CLUSTER_NAME_TAG_KEY, TEST_CLUSTER)],
            ),
        );
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[]);

        reconciler.reconcile_public_ips(&service, false).await.unwrap();
        assert_eq!(mock.call_count("delete_public_ip"), 0);
        let pip = mock.public_ip(TEST_RESOURCE_GROUP, "shared").unwrap();
        assert_eq!(pip.tags.get(SERVICE_TAG_KEY).map(String::as_str), Some("default/a"));
    }

    #[tokio::test]
    async fn test_internal_service_releases_its_public_ip() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());

        let external = create_test_service("web", &[]);
        reconciler.reconcile_public_ips(&external, true).await.unwrap();

        let internal = create_test_service("web", &[(ANNOTATION_INTERNAL, "true")]);
        assert!(reconciler.reconcile_public_ips(&internal, true).await.unwrap().is_none());
        assert!(mock.public_ip(TEST_RESOURCE_GROUP, "pip-default_web").is_none());
    }

    #[tokio::test]
    async fn test_existing_public_ip_follows_service_family() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        let name = format!("pip-default_web{}", IPV6_SUFFIX);
        mock.add_public_ip(
            TEST_RESOURCE_GROUP,
            tagged_public_ip(
                &name,
                "20.0.0.1",
                &[(SERVICE_TAG_KEY, "default/web"), (CLUSTER_NAME_TAG_KEY, TEST_CLUSTER)],
            ),
        );
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let mut service = create_test_service("web", &[]);
        service.ipv6 = true;

        let pip = reconciler
            .reconcile_public_ips(&service, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pip.name, name);
        assert_eq!(pip.properties.public_ip_address_version, Some(IPVersion::IPv6));
        assert!(pip.properties.ip_address.as_deref().unwrap().contains(':'));
        assert_eq!(mock.call_count("create_or_update_public_ip"), 1);
    }

    #[tokio::test]
    async fn test_deleted_public_ip_takes_its_frontend_rules_and_health_checks() {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        seed_node(&mock, "n1", "10.240.0.4", TEST_PRIMARY_VM_SET);
        let nodes = vec![create_test_node("n1", "10.240.0.4")];
        let web = create_test_service("web", &[]);
        let api = create_test_service("api", &[]);
        {
            let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
            for service in [&web, &api] {
                reconciler.ensure_load_balancer(service, &nodes).await.unwrap();
            }
        }
        let before = mock.load_balancer(TEST_RESOURCE_GROUP, TEST_CLUSTER).unwrap();
        assert_eq!(before.properties.probes.len(), 2);

        // A fresh reconciler sees the public IP still bound to its frontend
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        reconciler.reconcile_public_ips(&web, false).await.unwrap();

        assert!(mock.public_ip(TEST_RESOURCE_GROUP, "pip-default_web").is_none());
        let lb = mock.load_balancer(TEST_RESOURCE_GROUP, TEST_CLUSTER).unwrap();
        let fips: Vec<&str> = lb
            .properties
            .frontend_ip_configurations
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(fips, vec!["default_api"]);
        assert_eq!(lb.properties.load_balancing_rules.len(), 1);
        assert_eq!(lb.properties.probes.len(), 1);
        assert!(lb.properties.probes[0].name.starts_with("default_api"));
    }
}
