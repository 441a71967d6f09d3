//! Task: config propagation.
//!
//! Applies the fixed operator-relevant keys first, then the free-form
//! extras, then runs the read-back verification pass. Every applied key
//! is recorded in the audit log as it lands.

use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;

use meshboot_shared::MeshbootResult;

use crate::configstore::{ConfigPropagator, ConfigValue, Provenance};
use crate::context::Ctx;
use crate::pipeline::PipelineTask;
use crate::runner::Outcome;
use crate::topology::Node;

pub struct ConfigPropagateTask {
    pub coordinator: Arc<Node>,
}

fn generate_seed() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn put(
    prop: &mut ConfigPropagator,
    ctx: &Ctx,
    key: &str,
    value: ConfigValue,
    provenance: Provenance,
) -> MeshbootResult<()> {
    let rendered = value.to_string();
    prop.set(key, value, provenance).await?;
    ctx.audit.lock().config_applied(key, &rendered);
    Ok(())
}

#[async_trait]
impl PipelineTask<Ctx> for ConfigPropagateTask {
    async fn run(self: Box<Self>, ctx: Ctx) -> MeshbootResult<Outcome> {
        let mut prop = ConfigPropagator::new(
            Arc::clone(&ctx.runner),
            Arc::clone(&self.coordinator),
            ctx.config.etcd_endpoint.clone(),
        );

        // A previously stored seed is reused verbatim: credentials are
        // derived from it, so rotating it on a re-run would invalidate
        // every one of them cluster-wide.
        let (seed, seed_provenance) = match &ctx.config.auth_secret_seed {
            Some(seed) => (seed.clone(), Provenance::Operator),
            None => match prop.get("AUTH_SECRET_SEED").await? {
                Some(existing) => (existing, Provenance::Computed),
                None => (generate_seed(), Provenance::Computed),
            },
        };
        put(
            &mut prop,
            &ctx,
            "AUTH_SECRET_SEED",
            ConfigValue::Str(seed),
            seed_provenance,
        )
        .await?;

        put(
            &mut prop,
            &ctx,
            "RAM_SYSTEM_RESERVATION",
            ConfigValue::Float(ctx.config.ram_system_reservation),
            Provenance::Operator,
        )
        .await?;

        match ctx.facts.mtu_ceiling() {
            Some(ceiling) => {
                put(
                    &mut prop,
                    &ctx,
                    "MAX_HYPERVISOR_MTU",
                    ConfigValue::Int(i64::from(ceiling)),
                    Provenance::Computed,
                )
                .await?;
            }
            // Reachable only under tag filtering, when the MTU stages
            // were skipped this run.
            None => {
                tracing::warn!("no MTU ceiling computed this run, skipping MAX_HYPERVISOR_MTU")
            }
        }

        put(
            &mut prop,
            &ctx,
            "DNS_SERVER",
            ConfigValue::Str(ctx.config.dns_server.clone()),
            Provenance::Operator,
        )
        .await?;

        if let Some(proxy) = &ctx.config.http_proxy {
            put(
                &mut prop,
                &ctx,
                "HTTP_PROXY",
                ConfigValue::Str(proxy.clone()),
                Provenance::Operator,
            )
            .await?;
        }

        for (key, value) in &ctx.config.extra_config {
            put(
                &mut prop,
                &ctx,
                key,
                ConfigValue::Str(value.clone()),
                Provenance::Extra,
            )
            .await?;
        }

        prop.verify().await?;
        Ok(Outcome::Applied)
    }

    fn name(&self) -> &str {
        "config-propagation"
    }

    fn host(&self) -> &str {
        &self.coordinator.name
    }
}
