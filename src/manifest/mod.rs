mod templates;

use std::fs;
use std::path::PathBuf;

use crate::errors::{ClusterMgrError, Result};

/// The closed enumeration of manifest kinds from §4.1. Each kind maps to
/// exactly one template file name and one deterministic path-naming rule
/// (§6's filesystem layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    IngressGateway,
    EgressGateway,
    EgressDestination,
    ExternalService,
    Consul,
    TenantFlowControl,
    RouteReflector,
    DockerCredentialCopy,
    ApodDeployment,
    ApodHeadless,
    ApodInService,
    ApodOutService,
    ApodConnectVirtualService,
    ApodForVirtualService,
    CpodDeployment,
    CpodHealth,
    CpodHeadless,
    CpodInService,
    CpodOutService,
    CpodInServiceReplica,
    CpodConnectVirtualService,
    CpodForVirtualService,
    CpodForVirtualServiceReplica,
}

impl ManifestKind {
    fn template_file(self) -> &'static str {
        use ManifestKind::*;
        match self {
            IngressGateway => "ingress_gw.yaml",
            EgressGateway => "egress_gw.yaml",
            EgressDestination => "egress_gw_dest.yaml",
            ExternalService => "ext_svc.yaml",
            Consul => "consul.yaml",
            TenantFlowControl => "flow_control.yaml",
            RouteReflector => "route_reflector.yaml",
            DockerCredentialCopy => "regcred.yaml",
            ApodDeployment | CpodDeployment => "deploy_pod.yaml",
            ApodHeadless | CpodHeadless => "headless.yaml",
            ApodInService | CpodInService | CpodInServiceReplica => "service_inside.yaml",
            ApodOutService | CpodOutService => "service_outside.yaml",
            ApodConnectVirtualService | CpodConnectVirtualService => "nextensio_connect.yaml",
            ApodForVirtualService | CpodForVirtualService | CpodForVirtualServiceReplica => {
                "nextensio_for.yaml"
            }
            CpodHealth => "health_cpod.yaml",
        }
    }
}

/// Inputs to a single manifest render. Only the fields a given
/// [`ManifestKind`] needs are consulted; unused fields are simply ignored by
/// [`templates::substitute`].
#[derive(Debug, Default, Clone)]
pub struct ManifestParams<'a> {
    pub tenant: Option<&'a str>,
    pub pod: Option<&'a str>,
    pub host: Option<&'a str>,
    pub gateway: Option<&'a str>,
    pub image: Option<&'a str>,
    pub cluster: Option<&'a str>,
    pub wan_ip: Option<&'a str>,
    pub storage_class: Option<&'a str>,
    pub mongo_uri: Option<&'a str>,
    pub agent: Option<&'a str>,
}

/// Pure function of (kind, params) -> (path, body); §4.1's contract.
pub struct ManifestRenderer {
    template_dir: PathBuf,
    base_dir: PathBuf,
}

impl ManifestRenderer {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            base_dir: PathBuf::from("/tmp"),
        }
    }

    /// Used by tests to avoid writing under the real `/tmp` (§5's resource
    /// model still names `/tmp` as the layout root in production).
    #[cfg(test)]
    pub fn with_base_dir(template_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.base_dir.join(tenant)
    }

    /// Deterministic on-disk path for (kind, params); same inputs always
    /// yield the same path.
    pub fn path_for(&self, kind: ManifestKind, params: &ManifestParams) -> PathBuf {
        use ManifestKind::*;
        match kind {
            IngressGateway => self.base_dir.join("igw.yaml"),
            EgressGateway => self
                .base_dir
                .join(format!("egw-{}.yaml", params.gateway.unwrap_or_default())),
            EgressDestination => self.base_dir.join(format!(
                "egwdst-{}.yaml",
                params.gateway.unwrap_or_default()
            )),
            ExternalService => self.base_dir.join(format!(
                "extsvc-{}.yaml",
                params.gateway.unwrap_or_default()
            )),
            Consul => self.base_dir.join("consul.yaml"),
            TenantFlowControl => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join("flow_control.yaml"),
            RouteReflector => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join("route_reflector.yaml"),
            DockerCredentialCopy => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join("regcred.yaml"),
            ApodDeployment | CpodDeployment => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!("deploy-{}.yaml", params.pod.unwrap_or_default())),
            ApodHeadless | CpodHeadless => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!("headless-{}.yaml", params.pod.unwrap_or_default())),
            ApodInService | CpodInService | CpodInServiceReplica => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!(
                    "service-inside-{}.yaml",
                    params.host.unwrap_or_default()
                )),
            ApodOutService | CpodOutService => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!(
                    "service-outside-{}.yaml",
                    params.pod.unwrap_or_default()
                )),
            ApodConnectVirtualService | CpodConnectVirtualService => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!(
                    "nxtconnect-{}.yaml",
                    params.pod.unwrap_or_default()
                )),
            ApodForVirtualService | CpodForVirtualService | CpodForVirtualServiceReplica => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!("nxtfor-{}.yaml", params.host.unwrap_or_default())),
            CpodHealth => self
                .tenant_dir(params.tenant.unwrap_or_default())
                .join(format!("health-{}.yaml", params.pod.unwrap_or_default())),
        }
    }

    /// Reads the template, substitutes placeholders, and returns the
    /// deterministic path alongside the rendered body. Failure to read the
    /// template is a fatal configuration error (§4.1).
    pub fn render(&self, kind: ManifestKind, params: &ManifestParams) -> Result<(PathBuf, String)> {
        let path = self.path_for(kind, params);
        let template_path = self.template_dir.join(kind.template_file());
        let raw = fs::read_to_string(&template_path).map_err(|source| ClusterMgrError::Template {
            path: template_path.display().to_string(),
            source,
        })?;
        let body = templates::substitute(&raw, params);
        Ok((path, body))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir) {
        let templates = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        fs::write(
            templates.path().join("deploy_pod.yaml"),
            "ns: REPLACE_NAMESPACE\npod: REPLACE_POD_NAME\nimage: REPLACE_IMAGE\n",
        )
        .unwrap();
        (templates, base)
    }

    #[test]
    fn apod_deployment_path_is_deterministic() {
        let (templates, base) = setup();
        let renderer = ManifestRenderer::with_base_dir(templates.path(), base.path());
        let params = ManifestParams {
            tenant: Some("nextensio"),
            pod: Some("apod1"),
            image: Some("minion:latest"),
            ..Default::default()
        };
        let (path1, body1) = renderer.render(ManifestKind::ApodDeployment, &params).unwrap();
        let (path2, body2) = renderer.render(ManifestKind::ApodDeployment, &params).unwrap();
        assert_eq!(path1, path2);
        assert_eq!(body1, body2);
        assert_eq!(path1, base.path().join("nextensio/deploy-apod1.yaml"));
        assert!(body1.contains("nextensio"));
        assert!(body1.contains("apod1"));
        assert!(body1.contains("minion:latest"));
    }

    #[test]
    fn missing_template_is_an_error() {
        let templates = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let renderer = ManifestRenderer::with_base_dir(templates.path(), base.path());
        let params = ManifestParams::default();
        let err = renderer.render(ManifestKind::Consul, &params).unwrap_err();
        assert!(matches!(err, ClusterMgrError::Template { .. }));
    }

    #[test]
    fn egress_gateway_path_is_cluster_scoped() {
        let (templates, base) = setup();
        fs::write(templates.path().join("egress_gw.yaml"), "gw: REPLACE_GW").unwrap();
        let renderer = ManifestRenderer::with_base_dir(templates.path(), base.path());
        let params = ManifestParams {
            gateway: Some("gateway.west.nextensio.net"),
            ..Default::default()
        };
        let (path, _) = renderer.render(ManifestKind::EgressGateway, &params).unwrap();
        assert_eq!(
            path,
            base.path().join("egw-gateway.west.nextensio.net.yaml")
        );
    }
}
