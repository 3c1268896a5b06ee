//! Load balancer selection and the top-level load balancer reconcile.

use super::rules::{ExpectedRules, check_rule_conflicts};
use super::{LoadBalancerStatus, Reconciler};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::naming::{
    backend_pool_name, is_internal_load_balancer_name, is_service_rule, last_segment, load_balancer_name,
    resource_group_of, trim_internal_suffix,
};
use crate::service_view::{NodeView, ServiceView};
use crate::tags::{parse_tags, reconcile_tags};
use crate::vmset::select_vm_set_names;
use azure_client::{CacheReadType, FrontendIPConfiguration, LoadBalancer, Sku, SkuName};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

fn contains_ignore_case(set: &HashSet<String>, value: &str) -> bool {
    set.iter().any(|s| s.eq_ignore_ascii_case(value))
}

impl Reconciler {
    fn new_load_balancer(&self, name: &str) -> LoadBalancer {
        let config = self.config();
        LoadBalancer {
            name: name.to_string(),
            location: Some(config.location.clone()),
            sku: Some(Sku {
                name: if config.use_standard_load_balancer() {
                    SkuName::Standard
                } else {
                    SkuName::Basic
                },
            }),
            extended_location: config.extended_location(),
            ..Default::default()
        }
    }

    /// Load balancers this cluster manages: the ones named after the cluster
    /// or one of its agent pools, and any carrying the cluster backend pool
    pub(crate) async fn list_managed_load_balancers(
        &self,
        nodes: Option<&[NodeView]>,
    ) -> Result<Vec<LoadBalancer>, ControllerError> {
        let mut names = HashSet::from([self.cluster_name().to_lowercase()]);
        if let Some(nodes) = nodes {
            names.extend(self.vm_set.get_agent_pool_vm_set_names(nodes).await?);
        }
        let pool_name = backend_pool_name(self.cluster_name());

        let lbs = self.cloud.list_load_balancers().await?;
        Ok(lbs
            .into_iter()
            .filter(|lb| {
                contains_ignore_case(&names, trim_internal_suffix(&lb.name))
                    || lb
                        .properties
                        .backend_address_pools
                        .iter()
                        .any(|p| p.name.eq_ignore_ascii_case(&pool_name))
            })
            .collect())
    }

    /// Status of `service` on `lb` and the frontends it owns there
    pub(crate) async fn service_load_balancer_status(
        &self,
        service: &ServiceView,
        lb: &LoadBalancer,
    ) -> Result<(Option<LoadBalancerStatus>, Vec<FrontendIPConfiguration>), ControllerError> {
        let mut owned = Vec::new();
        let mut address = None;
        for fip in &lb.properties.frontend_ip_configurations {
            let (owns, _) = self.service_owns_frontend(fip, service).await?;
            if !owns {
                continue;
            }
            owned.push(fip.clone());
            if address.is_some() {
                continue;
            }
            address = match &fip.properties.public_ip_address {
                None => fip.properties.private_ip_address.clone(),
                Some(pip_ref) => {
                    let rg = resource_group_of(pip_ref.id())
                        .map_or_else(|| self.public_ip_resource_group(service), str::to_string);
                    self.cloud
                        .get_public_ip(&rg, last_segment(pip_ref.id()), CacheReadType::Default)
                        .await?
                        .and_then(|pip| pip.properties.ip_address)
                }
            };
        }

        let status = address.map(|ip| {
            let mut ingress = vec![ip];
            if !service.internal() {
                ingress.extend(service.options.additional_public_ips.iter().cloned());
            }
            LoadBalancerStatus { ingress }
        });
        Ok((status, owned))
    }

    /// Whether the Service sits on a load balancer its mode annotation no longer allows
    async fn should_change_load_balancer(
        &self,
        service: &ServiceView,
        lb_name: &str,
        nodes: Option<&[NodeView]>,
    ) -> Result<bool, ControllerError> {
        let config = self.config();
        let Some(nodes) = nodes else {
            return Ok(false);
        };
        if config.use_single_standard_load_balancer() {
            return Ok(false);
        }

        let primary = self.vm_set.primary_vm_set_name();
        let agent_pools = self.vm_set.get_agent_pool_vm_set_names(nodes).await?;
        let allowed = select_vm_set_names(&service.options.mode, &agent_pools, primary, false)?;
        let current = self.map_load_balancer_name_to_vm_set(lb_name);
        if allowed.iter().any(|s| s.eq_ignore_ascii_case(&current)) {
            return Ok(false);
        }

        let sharing = config.vm_sets_sharing_primary_slb();
        let on_primary = trim_internal_suffix(lb_name).eq_ignore_ascii_case(self.cluster_name());
        Ok(!(on_primary && allowed.iter().any(|s| contains_ignore_case(&sharing, s))))
    }

    /// The load balancer `service` lives on, or the one it should be placed on.
    ///
    /// Returns `(lb, status, exists)`. When the Service owns no frontend and
    /// `want_lb` is set, the least loaded eligible load balancer is chosen and
    /// a missing one is returned as a fresh, unsaved object.
    pub(crate) async fn get_service_load_balancer(
        &self,
        service: &ServiceView,
        nodes: Option<&[NodeView]>,
        want_lb: bool,
    ) -> Result<(LoadBalancer, Option<LoadBalancerStatus>, bool), ControllerError> {
        let config = self.config();
        let internal = service.internal();
        let action = if want_lb { actions::ENSURE } else { actions::DELETE };
        let primary = self.vm_set.primary_vm_set_name().to_string();
        let single_standard = config.use_single_standard_load_balancer();
        let sharing = config.vm_sets_sharing_primary_slb();
        let primary_lb_name = load_balancer_name(self.cluster_name(), &primary, &primary, false, single_standard, internal);

        let mut lbs = match self.list_managed_load_balancers(nodes).await {
            Ok(lbs) => lbs,
            Err(e) => {
                self.warn_event(service, reasons::LIST_LOAD_BALANCERS_FAILED, action, e.to_string())
                    .await;
                return Err(e);
            }
        };

        if let (true, Some(nodes)) = (config.use_multiple_standard_load_balancers(), nodes) {
            for lb in lbs
                .iter_mut()
                .filter(|lb| trim_internal_suffix(&lb.name).eq_ignore_ascii_case(self.cluster_name()))
            {
                self.cleanup_vm_set_from_backend_pool_by_condition(lb, nodes, |vm_set| {
                    !vm_set.eq_ignore_ascii_case(&primary) && !contains_ignore_case(&sharing, vm_set)
                })
                .await?;
            }
        }

        for lb in &mut lbs {
            if is_internal_load_balancer_name(&lb.name) != internal {
                continue;
            }
            let (status, owned) = self.service_load_balancer_status(service, lb).await?;
            if owned.is_empty() {
                continue;
            }
            if want_lb && self.should_change_load_balancer(service, &lb.name, nodes).await? {
                info!("{} no longer belongs on {}, moving it", service.key(), lb.name);
                self.remove_frontend_from_load_balancer(lb, service, &owned).await?;
                continue;
            }
            return Ok((lb.clone(), status, true));
        }

        if !want_lb {
            return Ok(match lbs.into_iter().find(|lb| lb.name.eq_ignore_ascii_case(&primary_lb_name)) {
                Some(lb) => (lb, None, true),
                None => (self.new_load_balancer(&primary_lb_name), None, false),
            });
        }

        let agent_pools = match nodes {
            Some(nodes) => self.vm_set.get_agent_pool_vm_set_names(nodes).await?,
            None => Vec::new(),
        };
        let vm_sets = select_vm_set_names(&service.options.mode, &agent_pools, &primary, single_standard)?;
        let mut candidates: Vec<String> = Vec::new();
        for vm_set in &vm_sets {
            let name = load_balancer_name(
                self.cluster_name(),
                vm_set,
                &primary,
                contains_ignore_case(&sharing, vm_set),
                single_standard,
                internal,
            );
            if !candidates.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
                candidates.push(name);
            }
        }

        let mut selected: Option<LoadBalancer> = None;
        for name in &candidates {
            let Some(lb) = lbs.iter().find(|lb| lb.name.eq_ignore_ascii_case(name)) else {
                debug!("{} is placed on new load balancer {}", service.key(), name);
                return Ok((self.new_load_balancer(name), None, false));
            };
            // Equal rule counts fall back to the name so the choice is stable
            let better = selected.as_ref().is_none_or(|s| {
                let (ours, theirs) = (lb.properties.load_balancing_rules.len(), s.properties.load_balancing_rules.len());
                ours < theirs || (ours == theirs && lb.name.to_lowercase() < s.name.to_lowercase())
            });
            if better {
                selected = Some(lb.clone());
            }
        }

        let Some(lb) = selected else {
            return Ok((self.new_load_balancer(&primary_lb_name), None, false));
        };
        let limit = config.maximum_load_balancer_rule_count;
        if limit > 0 && i32::try_from(lb.properties.load_balancing_rules.len()).unwrap_or(i32::MAX) >= limit {
            return Err(ControllerError::LoadBalancerRuleLimit(format!(
                "load balancer {} already has {} rules, the maximum is {}",
                lb.name,
                lb.properties.load_balancing_rules.len(),
                limit
            )));
        }
        Ok((lb, None, true))
    }

    /// Take `owned` frontends, their rules, probes and private link services
    /// off `lb`, deleting `lb` when nothing is left on it
    pub(crate) async fn remove_frontend_from_load_balancer(
        &self,
        lb: &mut LoadBalancer,
        service: &ServiceView,
        owned: &[FrontendIPConfiguration],
    ) -> Result<(), ControllerError> {
        let ids: Vec<String> = owned
            .iter()
            .map(|fip| fip.id.clone().unwrap_or_else(|| self.frontend_id(&lb.name, &fip.name)))
            .collect();
        for id in &ids {
            if let Some(pls) = self
                .cloud
                .get_private_link_service_by_frontend(id, CacheReadType::ForceRefresh)
                .await?
            {
                self.cloud.delete_private_link_service(&pls).await?;
            }
        }

        let props = &mut lb.properties;
        props
            .frontend_ip_configurations
            .retain(|fip| !owned.iter().any(|o| o.name.eq_ignore_ascii_case(&fip.name)));
        props.load_balancing_rules.retain(|rule| {
            let on_removed = rule
                .properties
                .frontend_ip_configuration
                .as_ref()
                .is_some_and(|f| ids.iter().any(|id| id.eq_ignore_ascii_case(f.id())));
            !on_removed && !is_service_rule(service, &rule.name)
        });
        props.probes.retain(|probe| !is_service_rule(service, &probe.name));

        if lb.properties.frontend_ip_configurations.is_empty() {
            self.clean_orphaned_load_balancer(lb, service).await
        } else {
            *lb = self.cloud.create_or_update_load_balancer(lb).await?;
            Ok(())
        }
    }

    /// Dispose of a load balancer with no frontend left. Load balancers with
    /// a pre-configured backend pool are kept and only updated.
    pub(crate) async fn clean_orphaned_load_balancer(
        &self,
        lb: &LoadBalancer,
        service: &ServiceView,
    ) -> Result<(), ControllerError> {
        let internal = is_internal_load_balancer_name(&lb.name);
        if self.config().is_backend_pool_pre_configured(internal) {
            info!(
                "load balancer {} has a pre-configured backend pool, keeping it for {}",
                lb.name,
                service.key()
            );
            if lb.id.is_some() {
                self.cloud.create_or_update_load_balancer(lb).await?;
            }
            return Ok(());
        }
        if lb.id.is_none() {
            return Ok(());
        }
        info!("deleting load balancer {}, it has no frontend left", lb.name);
        self.safe_delete_load_balancer(lb).await
    }

    /// Detach the backend pool from its members, then delete `lb`. A delete
    /// refused because a VM set still references the pool is retried once
    /// after detaching that VM set.
    pub(crate) async fn safe_delete_load_balancer(&self, lb: &LoadBalancer) -> Result<(), ControllerError> {
        let pool_name = backend_pool_name(self.cluster_name());
        let pool_id = self.backend_pool_id(&lb.name);
        let members: Vec<String> = lb
            .properties
            .backend_address_pools
            .iter()
            .filter(|p| p.name.eq_ignore_ascii_case(&pool_name))
            .flat_map(|p| p.properties.backend_ip_configurations.iter().map(|m| m.id().to_string()))
            .collect();
        if !members.is_empty() {
            self.vm_set.ensure_backend_pool_deleted(&pool_id, "", &members).await?;
        }

        match self.cloud.delete_load_balancer(&lb.name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let Some((_, vm_set)) = e.referenced_vm_set() else {
                    return Err(e.into());
                };
                warn!(
                    "deleting {} was refused, VM set {} still references its backend pool: {}",
                    lb.name, vm_set, e
                );
                let vm_sets = HashSet::from([vm_set.to_lowercase()]);
                self.vm_set
                    .ensure_backend_pool_deleted_from_vm_sets(&vm_sets, &pool_id)
                    .await?;
                self.cloud.delete_load_balancer(&lb.name).await?;
                Ok(())
            }
        }
    }

    /// Fold the load balancers of VM sets configured to share the primary
    /// one into it. Runs once per process.
    pub(crate) async fn reconcile_shared_load_balancer(
        &self,
        service: &ServiceView,
        nodes: &[NodeView],
    ) -> Result<(), ControllerError> {
        if self.shared_lb_synced.load(Ordering::Acquire) {
            return Ok(());
        }
        let config = self.config();
        let sharing = config.vm_sets_sharing_primary_slb();
        if !config.use_multiple_standard_load_balancers() || sharing.is_empty() {
            self.shared_lb_synced.store(true, Ordering::Release);
            return Ok(());
        }

        let _guard = self.shared_lb_lock.lock().await;
        if self.shared_lb_synced.load(Ordering::Acquire) {
            return Ok(());
        }

        let lbs = self.list_managed_load_balancers(Some(nodes)).await?;
        let mut primary_lbs = Vec::new();
        for lb in &lbs {
            let base = trim_internal_suffix(&lb.name);
            if base.eq_ignore_ascii_case(self.cluster_name()) {
                primary_lbs.push(lb.name.clone());
            } else if contains_ignore_case(&sharing, base) {
                info!("VM set {} shares the primary load balancer, deleting {}", base, lb.name);
                self.safe_delete_load_balancer(lb).await?;
            }
        }
        for lb_name in &primary_lbs {
            self.ensure_hosts_in_pool(service, nodes, lb_name).await?;
            self.cloud.invalidate_load_balancer(lb_name);
        }

        self.shared_lb_synced.store(true, Ordering::Release);
        Ok(())
    }

    /// Converge the load balancer side of `service`.
    ///
    /// With `want_lb` the Service gets a frontend, probes and rules and the
    /// nodes join the backend pool; the stored load balancer is returned.
    /// Without it the Service's frontend, probes and rules are removed and the
    /// load balancer deleted once empty. `nodes` is `None` on deletion paths
    /// where node membership is left untouched.
    pub(crate) async fn reconcile_load_balancer(
        &self,
        service: &ServiceView,
        nodes: Option<&[NodeView]>,
        want_lb: bool,
    ) -> Result<Option<LoadBalancer>, ControllerError> {
        let config = self.config();
        let action = if want_lb { actions::ENSURE } else { actions::DELETE };
        if let Some(nodes) = nodes {
            self.reconcile_shared_load_balancer(service, nodes).await?;
        }

        let (mut lb, _, exists) = self.get_service_load_balancer(service, nodes, want_lb).await?;
        if !exists && !want_lb {
            debug!("{} has no load balancer to clean up", service.key());
            return Ok(None);
        }
        let lb_name = lb.name.clone();
        debug!("reconcile_load_balancer({}, {}): want_lb={}", service.key(), lb_name, want_lb);

        let (pre_configured, pools_changed) = self
            .reconcile_backend_pools(&mut lb, service, nodes.unwrap_or_default())
            .await?;
        let mut dirty = !exists || pools_changed;

        let frontends = self.reconcile_frontends(&mut lb, service, want_lb).await?;
        dirty |= frontends.dirty;

        let expected = match (&frontends.owned, want_lb) {
            (Some(fip), true) => {
                let fip_id = fip.id.clone().unwrap_or_else(|| self.frontend_id(&lb_name, &fip.name));
                self.expected_rules_and_probes(service, &lb_name, &fip_id)?
            }
            _ => ExpectedRules::default(),
        };
        check_rule_conflicts(&lb, service, &expected.rules)?;
        dirty |= self.reconcile_rules_and_probes(&mut lb, service, &expected);

        if !config.tags.is_empty() || !config.tags_map.is_empty() {
            let desired = parse_tags(&config.tags, &config.tags_map);
            dirty |= reconcile_tags(&mut lb.tags, &desired, &config.system_tag_keys());
        }

        if dirty {
            for id in &frontends.removed_ids {
                if let Some(pls) = self
                    .cloud
                    .get_private_link_service_by_frontend(id, CacheReadType::ForceRefresh)
                    .await?
                {
                    info!("deleting private link service {} of removed frontend {}", pls.name, last_segment(id));
                    self.cloud.delete_private_link_service(&pls).await?;
                }
            }

            if lb.properties.frontend_ip_configurations.is_empty() {
                self.clean_orphaned_load_balancer(&lb, service).await?;
                return Ok(None);
            }

            info!("updating load balancer {} for {}", lb_name, service.key());
            match self.cloud.create_or_update_load_balancer(&lb).await {
                Ok(stored) => lb = stored,
                Err(e) => {
                    self.warn_event(service, reasons::CREATE_LOAD_BALANCER_FAILED, action, e.to_string())
                        .await;
                    return Err(e.into());
                }
            }
        }

        if !want_lb {
            return Ok(Some(lb));
        }

        let lb = self
            .cloud
            .get_load_balancer(&lb_name, CacheReadType::ForceRefresh)
            .await?
            .ok_or_else(|| ControllerError::Reconciliation(format!("load balancer {} not found after update", lb_name)))?;
        if let (Some(nodes), false) = (nodes, pre_configured) {
            self.ensure_hosts_in_pool(service, nodes, &lb_name).await?;
            self.cloud.invalidate_load_balancer(&lb_name);
        }
        Ok(Some(lb))
    }
}
