//! Unit tests for private link service reconciliation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::consts::*;
    use crate::error::ControllerError;
    use crate::service_view::ServiceView;
    use crate::test_utils::*;
    use azure_client::{
        FrontendIPConfiguration, IPAllocationMethod, MockAzureClient, PrivateLinkService, SubResource,
    };

    /// Create the internal load balancer for `service` and return its frontend
    async fn internal_frontend(mock: &MockAzureClient, reconciler: &Reconciler, service: &ServiceView) -> FrontendIPConfiguration {
        let nodes = vec![create_test_node("n1", "10.240.0.4")];
        reconciler
            .reconcile_load_balancer(service, Some(&nodes), true)
            .await
            .unwrap();
        mock.load_balancer(TEST_RESOURCE_GROUP, "kubernetes-internal")
            .unwrap()
            .properties
            .frontend_ip_configurations
            .remove(0)
    }

    fn setup() -> MockAzureClient {
        let mock = MockAzureClient::new(TEST_SUBSCRIPTION);
        seed_network(&mock);
        seed_node(&mock, "n1", "10.240.0.4", TEST_PRIMARY_VM_SET);
        mock
    }

    #[tokio::test]
    async fn test_private_link_service_is_created_on_frontend() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service(
            "web",
            &[
                (ANNOTATION_INTERNAL, "true"),
                (ANNOTATION_PLS_CREATE, "true"),
                (ANNOTATION_PLS_PROXY_PROTOCOL, "true"),
            ],
        );
        let fip = internal_frontend(&mock, &reconciler, &service).await;

        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();

        let pls = mock
            .private_link_service(TEST_RESOURCE_GROUP, "pls-default_web")
            .unwrap();
        assert_eq!(
            pls.properties.load_balancer_frontend_ip_configurations[0].id(),
            fip.id.as_deref().unwrap()
        );
        assert_eq!(pls.properties.ip_configurations.len(), 1);
        let config = &pls.properties.ip_configurations[0];
        assert_eq!(config.name, "subnet-pls-default_web-dynamic-0");
        assert_eq!(config.properties.primary, Some(true));
        assert_eq!(
            config.properties.private_ip_allocation_method,
            Some(IPAllocationMethod::Dynamic)
        );
        assert_eq!(pls.properties.enable_proxy_protocol, Some(true));
        assert_eq!(
            pls.tags.get(OWNER_SERVICE_TAG_KEY).map(String::as_str),
            Some("default/web")
        );
        assert_eq!(
            pls.tags.get(CLUSTER_NAME_TAG_KEY).map(String::as_str),
            Some(TEST_CLUSTER)
        );
        assert_eq!(mock.call_count("create_or_update_subnet"), 1);

        // Converged
        mock.clear_calls();
        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();
        assert_eq!(mock.call_count("create_or_update_private_link_service"), 0);
        assert_eq!(mock.call_count("create_or_update_subnet"), 0);
    }

    #[tokio::test]
    async fn test_static_addresses_come_first() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service(
            "web",
            &[
                (ANNOTATION_INTERNAL, "true"),
                (ANNOTATION_PLS_CREATE, "true"),
                (ANNOTATION_PLS_NAME, "my-pls"),
                (ANNOTATION_PLS_IP_CONFIGURATION_IPS, "10.240.0.9"),
                (ANNOTATION_PLS_IP_CONFIGURATION_IP_COUNT, "2"),
            ],
        );
        let fip = internal_frontend(&mock, &reconciler, &service).await;

        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();

        let pls = mock.private_link_service(TEST_RESOURCE_GROUP, "my-pls").unwrap();
        let names: Vec<&str> = pls
            .properties
            .ip_configurations
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["subnet-my-pls-static-10.240.0.9", "subnet-my-pls-dynamic-0"]
        );
        let primaries: Vec<Option<bool>> = pls
            .properties
            .ip_configurations
            .iter()
            .map(|c| c.properties.primary)
            .collect();
        assert_eq!(primaries, vec![Some(true), Some(false)]);
    }

    #[tokio::test]
    async fn test_ipv6_frontend_is_refused() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let mut service = create_test_service("web", &[(ANNOTATION_INTERNAL, "true"), (ANNOTATION_PLS_CREATE, "true")]);
        service.ipv6 = true;
        let fip = FrontendIPConfiguration {
            id: Some("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes-internal/frontendIPConfigurations/default_web".to_string()),
            name: "default_web".to_string(),
            ..Default::default()
        };

        let err = reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::PrivateLinkService(_)));

        // Nothing to remove either
        assert!(reconciler
            .reconcile_private_link_service(&service, &fip, false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unmanaged_private_link_service_is_not_touched() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_INTERNAL, "true"), (ANNOTATION_PLS_CREATE, "true")]);
        let fip = internal_frontend(&mock, &reconciler, &service).await;

        let mut foreign = PrivateLinkService {
            name: "pls-foreign".to_string(),
            ..Default::default()
        };
        foreign.tags.insert(OWNER_SERVICE_TAG_KEY.to_string(), "default/other".to_string());
        foreign.properties.load_balancer_frontend_ip_configurations =
            vec![SubResource::new(fip.id.clone().unwrap())];
        mock.add_private_link_service(TEST_RESOURCE_GROUP, foreign);

        let err = reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::PrivateLinkService(_)));

        reconciler
            .reconcile_private_link_service(&service, &fip, false)
            .await
            .unwrap();
        assert!(mock.private_link_service(TEST_RESOURCE_GROUP, "pls-foreign").is_some());
        assert_eq!(mock.call_count("delete_private_link_service"), 0);
    }

    #[tokio::test]
    async fn test_private_link_service_of_another_service_is_shared() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_INTERNAL, "true"), (ANNOTATION_PLS_CREATE, "true")]);
        let fip = internal_frontend(&mock, &reconciler, &service).await;

        let mut owned = PrivateLinkService {
            name: "pls-owner".to_string(),
            ..Default::default()
        };
        owned.tags.insert(OWNER_SERVICE_TAG_KEY.to_string(), "default/owner".to_string());
        owned.tags.insert(CLUSTER_NAME_TAG_KEY.to_string(), TEST_CLUSTER.to_string());
        owned.properties.load_balancer_frontend_ip_configurations = vec![SubResource::new(fip.id.clone().unwrap())];
        mock.add_private_link_service(TEST_RESOURCE_GROUP, owned);
        mock.clear_calls();

        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();
        assert!(mock.calls().is_empty(), "unexpected writes: {:?}", mock.calls());

        // Shaping someone else's private link service is refused
        let shaping = create_test_service(
            "web",
            &[
                (ANNOTATION_INTERNAL, "true"),
                (ANNOTATION_PLS_CREATE, "true"),
                (ANNOTATION_PLS_PROXY_PROTOCOL, "true"),
            ],
        );
        let err = reconciler
            .reconcile_private_link_service(&shaping, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::PrivateLinkService(_)));
    }

    #[tokio::test]
    async fn test_external_service_with_floating_ip_is_refused() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_PLS_CREATE, "true")]);
        let fip = FrontendIPConfiguration {
            id: Some("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/frontendIPConfigurations/default_web".to_string()),
            name: "default_web".to_string(),
            ..Default::default()
        };
        let err = reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::PrivateLinkService(_)));
    }

    #[tokio::test]
    async fn test_private_link_service_is_removed_when_not_wanted() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_INTERNAL, "true"), (ANNOTATION_PLS_CREATE, "true")]);
        let fip = internal_frontend(&mock, &reconciler, &service).await;

        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();
        reconciler
            .reconcile_private_link_service(&service, &fip, false)
            .await
            .unwrap();
        assert!(mock.private_link_service(TEST_RESOURCE_GROUP, "pls-default_web").is_none());
    }

    #[tokio::test]
    async fn test_renaming_existing_private_link_service_is_refused() {
        let mock = setup();
        let (reconciler, _) = create_test_reconciler(&mock, create_test_config());
        let service = create_test_service("web", &[(ANNOTATION_INTERNAL, "true"), (ANNOTATION_PLS_CREATE, "true")]);
        let fip = internal_frontend(&mock, &reconciler, &service).await;
        reconciler
            .reconcile_private_link_service(&service, &fip, true)
            .await
            .unwrap();

        let renamed = create_test_service(
            "web",
            &[
                (ANNOTATION_INTERNAL, "true"),
                (ANNOTATION_PLS_CREATE, "true"),
                (ANNOTATION_PLS_NAME, "another-name"),
            ],
        );
        let err = reconciler
            .reconcile_private_link_service(&renamed, &fip, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::PrivateLinkService(_)));
    }
}
