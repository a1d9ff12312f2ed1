//! Endpoint Resolver
//!
//! Computes the base URL of every service family for one provider activation.
//! Defaults come from compiled-in tables; when the environment selects mTLS
//! every default (and no override) is rewritten to its `.mtls.` host, then the
//! universe domain is applied, then per-service overrides are layered on top.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::config::env::Environment;
use crate::config::resolver::parse_bool;
use crate::error::{Error, Result};

pub const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

/// Synthetic endpoint used to ask the transport which variant it would pick.
const MOCK_ENDPOINT: &str = "https://mockservice.googleapis.com/v1/";

/// One service family: its key, its override field, and its default base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub service: &'static str,
    pub field: &'static str,
    pub default_base_path: &'static str,
}

const fn ep(
    service: &'static str,
    field: &'static str,
    default_base_path: &'static str,
) -> ServiceEndpoint {
    ServiceEndpoint {
        service,
        field,
        default_base_path,
    }
}

// =========================================================================
// Service tables
// =========================================================================

/// Products whose clients are generated from API descriptions.
const GENERATED_ENDPOINTS: &[ServiceEndpoint] = &[
    ep("AccessApproval", "access_approval_custom_endpoint", "https://accessapproval.googleapis.com/v1/"),
    ep("AccessContextManager", "access_context_manager_custom_endpoint", "https://accesscontextmanager.googleapis.com/v1/"),
    ep("ActiveDirectory", "active_directory_custom_endpoint", "https://managedidentities.googleapis.com/v1/"),
    ep("Alloydb", "alloydb_custom_endpoint", "https://alloydb.googleapis.com/v1/"),
    ep("Apigee", "apigee_custom_endpoint", "https://apigee.googleapis.com/v1/"),
    ep("AppEngine", "app_engine_custom_endpoint", "https://appengine.googleapis.com/v1/"),
    ep("Apphub", "apphub_custom_endpoint", "https://apphub.googleapis.com/v1/"),
    ep("ArtifactRegistry", "artifact_registry_custom_endpoint", "https://artifactregistry.googleapis.com/v1/"),
    ep("BackupDR", "backup_dr_custom_endpoint", "https://backupdr.googleapis.com/v1/"),
    ep("Beyondcorp", "beyondcorp_custom_endpoint", "https://beyondcorp.googleapis.com/v1/"),
    ep("Biglake", "biglake_custom_endpoint", "https://biglake.googleapis.com/v1/"),
    ep("BigQuery", "big_query_custom_endpoint", "https://bigquery.googleapis.com/bigquery/v2/"),
    ep("BigqueryAnalyticsHub", "bigquery_analytics_hub_custom_endpoint", "https://analyticshub.googleapis.com/v1/"),
    ep("BigqueryConnection", "bigquery_connection_custom_endpoint", "https://bigqueryconnection.googleapis.com/v1/"),
    ep("BigqueryDatapolicy", "bigquery_datapolicy_custom_endpoint", "https://bigquerydatapolicy.googleapis.com/v1/"),
    ep("BigqueryDataTransfer", "bigquery_data_transfer_custom_endpoint", "https://bigquerydatatransfer.googleapis.com/v1/"),
    ep("BigqueryReservation", "bigquery_reservation_custom_endpoint", "https://bigqueryreservation.googleapis.com/v1/"),
    ep("Bigtable", "bigtable_custom_endpoint", "https://bigtableadmin.googleapis.com/v2/"),
    ep("Billing", "billing_custom_endpoint", "https://billingbudgets.googleapis.com/v1/"),
    ep("BinaryAuthorization", "binary_authorization_custom_endpoint", "https://binaryauthorization.googleapis.com/v1/"),
    ep("BlockchainNodeEngine", "blockchain_node_engine_custom_endpoint", "https://blockchainnodeengine.googleapis.com/v1/"),
    ep("CertificateManager", "certificate_manager_custom_endpoint", "https://certificatemanager.googleapis.com/v1/"),
    ep("CloudAsset", "cloud_asset_custom_endpoint", "https://cloudasset.googleapis.com/v1/"),
    ep("CloudBuild", "cloud_build_custom_endpoint", "https://cloudbuild.googleapis.com/v1/"),
    ep("Cloudbuildv2", "cloudbuildv2_custom_endpoint", "https://cloudbuild.googleapis.com/v2/"),
    ep("Clouddeploy", "clouddeploy_custom_endpoint", "https://clouddeploy.googleapis.com/v1/"),
    ep("Clouddomains", "clouddomains_custom_endpoint", "https://domains.googleapis.com/v1/"),
    ep("CloudFunctions", "cloud_functions_custom_endpoint", "https://cloudfunctions.googleapis.com/v1/"),
    ep("Cloudfunctions2", "cloudfunctions2_custom_endpoint", "https://cloudfunctions.googleapis.com/v2/"),
    ep("CloudIdentity", "cloud_identity_custom_endpoint", "https://cloudidentity.googleapis.com/v1/"),
    ep("CloudIds", "cloud_ids_custom_endpoint", "https://ids.googleapis.com/v1/"),
    ep("CloudQuotas", "cloud_quotas_custom_endpoint", "https://cloudquotas.googleapis.com/v1/"),
    ep("CloudRun", "cloud_run_custom_endpoint", "https://{{location}}-run.googleapis.com/"),
    ep("CloudRunV2", "cloud_run_v2_custom_endpoint", "https://run.googleapis.com/v2/"),
    ep("CloudScheduler", "cloud_scheduler_custom_endpoint", "https://cloudscheduler.googleapis.com/v1/"),
    ep("CloudTasks", "cloud_tasks_custom_endpoint", "https://cloudtasks.googleapis.com/v2/"),
    ep("Composer", "composer_custom_endpoint", "https://composer.googleapis.com/v1/"),
    ep("Compute", "compute_custom_endpoint", "https://compute.googleapis.com/compute/v1/"),
    ep("ContainerAnalysis", "container_analysis_custom_endpoint", "https://containeranalysis.googleapis.com/v1/"),
    ep("ContainerAttached", "container_attached_custom_endpoint", "https://{{location}}-gkemulticloud.googleapis.com/v1/"),
    ep("CoreBilling", "core_billing_custom_endpoint", "https://cloudbilling.googleapis.com/v1/"),
    ep("DatabaseMigrationService", "database_migration_service_custom_endpoint", "https://datamigration.googleapis.com/v1/"),
    ep("DataCatalog", "data_catalog_custom_endpoint", "https://datacatalog.googleapis.com/v1/"),
    ep("DataFusion", "data_fusion_custom_endpoint", "https://datafusion.googleapis.com/v1/"),
    ep("DataLossPrevention", "data_loss_prevention_custom_endpoint", "https://dlp.googleapis.com/v2/"),
    ep("DataPipeline", "data_pipeline_custom_endpoint", "https://datapipelines.googleapis.com/v1/"),
    ep("Dataplex", "dataplex_custom_endpoint", "https://dataplex.googleapis.com/v1/"),
    ep("Dataproc", "dataproc_custom_endpoint", "https://dataproc.googleapis.com/v1/"),
    ep("DataprocGdc", "dataproc_gdc_custom_endpoint", "https://dataprocgdc.googleapis.com/v1/"),
    ep("DataprocMetastore", "dataproc_metastore_custom_endpoint", "https://metastore.googleapis.com/v1/"),
    ep("Datastream", "datastream_custom_endpoint", "https://datastream.googleapis.com/v1/"),
    ep("DeploymentManager", "deployment_manager_custom_endpoint", "https://www.googleapis.com/deploymentmanager/v2/"),
    ep("Dialogflow", "dialogflow_custom_endpoint", "https://dialogflow.googleapis.com/v2/"),
    ep("DialogflowCX", "dialogflow_cx_custom_endpoint", "https://{{location}}-dialogflow.googleapis.com/v3/"),
    ep("DiscoveryEngine", "discovery_engine_custom_endpoint", "https://{{location}}-discoveryengine.googleapis.com/v1/"),
    ep("DNS", "dns_custom_endpoint", "https://dns.googleapis.com/dns/v1/"),
    ep("DocumentAI", "document_ai_custom_endpoint", "https://{{location}}-documentai.googleapis.com/v1/"),
    ep("DocumentAIWarehouse", "document_ai_warehouse_custom_endpoint", "https://contentwarehouse.googleapis.com/v1/"),
    ep("Edgecontainer", "edgecontainer_custom_endpoint", "https://edgecontainer.googleapis.com/v1/"),
    ep("Edgenetwork", "edgenetwork_custom_endpoint", "https://edgenetwork.googleapis.com/v1/"),
    ep("EssentialContacts", "essential_contacts_custom_endpoint", "https://essentialcontacts.googleapis.com/v1/"),
    ep("Filestore", "filestore_custom_endpoint", "https://file.googleapis.com/v1/"),
    ep("FirebaseAppCheck", "firebase_app_check_custom_endpoint", "https://firebaseappcheck.googleapis.com/v1/"),
    ep("Firestore", "firestore_custom_endpoint", "https://firestore.googleapis.com/v1/"),
    ep("GKEBackup", "gke_backup_custom_endpoint", "https://gkebackup.googleapis.com/v1/"),
    ep("GKEHub", "gke_hub_custom_endpoint", "https://gkehub.googleapis.com/v1/"),
    ep("GKEHub2", "gke_hub2_custom_endpoint", "https://gkehub.googleapis.com/v1/"),
    ep("Gkeonprem", "gkeonprem_custom_endpoint", "https://gkeonprem.googleapis.com/v1/"),
    ep("Healthcare", "healthcare_custom_endpoint", "https://healthcare.googleapis.com/v1/"),
    ep("IAM2", "iam2_custom_endpoint", "https://iam.googleapis.com/v2/"),
    ep("IAMBeta", "iam_beta_custom_endpoint", "https://iam.googleapis.com/v1/"),
    ep("IAMWorkforcePool", "iam_workforce_pool_custom_endpoint", "https://iam.googleapis.com/v1/"),
    ep("Iap", "iap_custom_endpoint", "https://iap.googleapis.com/v1/"),
    ep("IdentityPlatform", "identity_platform_custom_endpoint", "https://identitytoolkit.googleapis.com/v2/"),
    ep("IntegrationConnectors", "integration_connectors_custom_endpoint", "https://connectors.googleapis.com/v1/"),
    ep("Integrations", "integrations_custom_endpoint", "https://integrations.googleapis.com/v1/"),
    ep("KMS", "kms_custom_endpoint", "https://cloudkms.googleapis.com/v1/"),
    ep("Logging", "logging_custom_endpoint", "https://logging.googleapis.com/v2/"),
    ep("Looker", "looker_custom_endpoint", "https://looker.googleapis.com/v1/"),
    ep("ManagedKafka", "managed_kafka_custom_endpoint", "https://managedkafka.googleapis.com/v1/"),
    ep("Memcache", "memcache_custom_endpoint", "https://memcache.googleapis.com/v1/"),
    ep("Memorystore", "memorystore_custom_endpoint", "https://memorystore.googleapis.com/v1/"),
    ep("MigrationCenter", "migration_center_custom_endpoint", "https://migrationcenter.googleapis.com/v1/"),
    ep("MLEngine", "ml_engine_custom_endpoint", "https://ml.googleapis.com/v1/"),
    ep("Monitoring", "monitoring_custom_endpoint", "https://monitoring.googleapis.com/"),
    ep("Netapp", "netapp_custom_endpoint", "https://netapp.googleapis.com/v1/"),
    ep("NetworkConnectivity", "network_connectivity_custom_endpoint", "https://networkconnectivity.googleapis.com/v1/"),
    ep("NetworkManagement", "network_management_custom_endpoint", "https://networkmanagement.googleapis.com/v1/"),
    ep("NetworkSecurity", "network_security_custom_endpoint", "https://networksecurity.googleapis.com/v1/"),
    ep("NetworkServices", "network_services_custom_endpoint", "https://networkservices.googleapis.com/v1/"),
    ep("Notebooks", "notebooks_custom_endpoint", "https://notebooks.googleapis.com/v1/"),
    ep("OracleDatabase", "oracle_database_custom_endpoint", "https://oracledatabase.googleapis.com/v1/"),
    ep("OrgPolicy", "org_policy_custom_endpoint", "https://orgpolicy.googleapis.com/v2/"),
    ep("OSConfig", "os_config_custom_endpoint", "https://osconfig.googleapis.com/v1/"),
    ep("OSLogin", "os_login_custom_endpoint", "https://oslogin.googleapis.com/v1/"),
    ep("Parallelstore", "parallelstore_custom_endpoint", "https://parallelstore.googleapis.com/v1/"),
    ep("Privateca", "privateca_custom_endpoint", "https://privateca.googleapis.com/v1/"),
    ep("PrivilegedAccessManager", "privileged_access_manager_custom_endpoint", "https://privilegedaccessmanager.googleapis.com/v1/"),
    ep("PublicCA", "public_ca_custom_endpoint", "https://publicca.googleapis.com/v1/"),
    ep("Pubsub", "pubsub_custom_endpoint", "https://pubsub.googleapis.com/v1/"),
    ep("PubsubLite", "pubsub_lite_custom_endpoint", "https://{{region}}-pubsublite.googleapis.com/v1/admin/"),
    ep("Redis", "redis_custom_endpoint", "https://redis.googleapis.com/v1/"),
    ep("ResourceManager", "resource_manager_custom_endpoint", "https://cloudresourcemanager.googleapis.com/v1/"),
    ep("SecretManager", "secret_manager_custom_endpoint", "https://secretmanager.googleapis.com/v1/"),
    ep("SecretManagerRegional", "secret_manager_regional_custom_endpoint", "https://secretmanager.{{location}}.rep.googleapis.com/v1/"),
    ep("SecureSourceManager", "secure_source_manager_custom_endpoint", "https://securesourcemanager.googleapis.com/v1/"),
    ep("SecurityCenter", "security_center_custom_endpoint", "https://securitycenter.googleapis.com/v1/"),
    ep("SecurityCenterManagement", "security_center_management_custom_endpoint", "https://securitycentermanagement.googleapis.com/v1/"),
    ep("SecurityCenterV2", "security_center_v2_custom_endpoint", "https://securitycenter.googleapis.com/v2/"),
    ep("Securityposture", "securityposture_custom_endpoint", "https://securityposture.googleapis.com/v1/"),
    ep("ServiceManagement", "service_management_custom_endpoint", "https://servicemanagement.googleapis.com/v1/"),
    ep("ServiceNetworking", "service_networking_custom_endpoint", "https://servicenetworking.googleapis.com/v1/"),
    ep("ServiceUsage", "service_usage_custom_endpoint", "https://serviceusage.googleapis.com/v1/"),
    ep("SiteVerification", "site_verification_custom_endpoint", "https://www.googleapis.com/siteVerification/v1/"),
    ep("SourceRepo", "source_repo_custom_endpoint", "https://sourcerepo.googleapis.com/v1/"),
    ep("Spanner", "spanner_custom_endpoint", "https://spanner.googleapis.com/v1/"),
    ep("SQL", "sql_custom_endpoint", "https://sqladmin.googleapis.com/sql/v1beta4/"),
    ep("Storage", "storage_custom_endpoint", "https://storage.googleapis.com/storage/v1/"),
    ep("StorageInsights", "storage_insights_custom_endpoint", "https://storageinsights.googleapis.com/v1/"),
    ep("StorageTransfer", "storage_transfer_custom_endpoint", "https://storagetransfer.googleapis.com/v1/"),
    ep("Tags", "tags_custom_endpoint", "https://cloudresourcemanager.googleapis.com/v3/"),
    ep("TPU", "tpu_custom_endpoint", "https://tpu.googleapis.com/v1/"),
    ep("Transcoder", "transcoder_custom_endpoint", "https://transcoder.googleapis.com/v1/"),
    ep("VertexAI", "vertex_ai_custom_endpoint", "https://{{region}}-aiplatform.googleapis.com/v1/"),
    ep("Vmwareengine", "vmwareengine_custom_endpoint", "https://vmwareengine.googleapis.com/v1/"),
    ep("VPCAccess", "vpc_access_custom_endpoint", "https://vpcaccess.googleapis.com/v1/"),
    ep("Workbench", "workbench_custom_endpoint", "https://notebooks.googleapis.com/v2/"),
    ep("Workflows", "workflows_custom_endpoint", "https://workflows.googleapis.com/v1/"),
];

/// Products with handwritten clients.
const HANDWRITTEN_ENDPOINTS: &[ServiceEndpoint] = &[
    ep("CloudBilling", "cloud_billing_custom_endpoint", "https://cloudbilling.googleapis.com/v1/"),
    ep("Container", "container_custom_endpoint", "https://container.googleapis.com/v1/"),
    ep("Dataflow", "dataflow_custom_endpoint", "https://dataflow.googleapis.com/v1b3/"),
    ep("IAM", "iam_custom_endpoint", "https://iam.googleapis.com/v1/"),
    ep("IamCredentials", "iam_credentials_custom_endpoint", "https://iamcredentials.googleapis.com/v1/"),
    ep("ResourceManagerV3", "resource_manager_v3_custom_endpoint", "https://cloudresourcemanager.googleapis.com/v3/"),
    ep("BigtableAdmin", "bigtable_custom_endpoint", "https://bigtableadmin.googleapis.com/v2/"),
    ep("TagsLocation", "tags_location_custom_endpoint", "https://{{location}}-cloudresourcemanager.googleapis.com/v3/"),
];

/// Products served through the declarative client library.
const DCL_ENDPOINTS: &[ServiceEndpoint] = &[
    ep("ContainerAws", "container_aws_custom_endpoint", "https://{{location}}-gkemulticloud.googleapis.com/v1/"),
    ep("ContainerAzure", "container_azure_custom_endpoint", "https://{{location}}-gkemulticloud.googleapis.com/v1/"),
    ep("Apikeys", "apikeys_custom_endpoint", "https://apikeys.googleapis.com/v2/"),
    ep("Firebaserules", "firebaserules_custom_endpoint", "https://firebaserules.googleapis.com/v1/"),
    ep("RecaptchaEnterprise", "recaptcha_enterprise_custom_endpoint", "https://recaptchaenterprise.googleapis.com/v1/"),
];

const PARTIAL_TABLES: &[&[ServiceEndpoint]] =
    &[GENERATED_ENDPOINTS, HANDWRITTEN_ENDPOINTS, DCL_ENDPOINTS];

/// Merge partial tables into one keyed table, failing on a repeated key.
pub fn merge_tables(
    tables: &[&'static [ServiceEndpoint]],
) -> Result<BTreeMap<&'static str, ServiceEndpoint>> {
    let mut merged = BTreeMap::new();
    let mut duplicates = Vec::new();
    for table in tables {
        for endpoint in table.iter() {
            if merged.insert(endpoint.service, *endpoint).is_some() {
                duplicates.push(endpoint.service);
            }
        }
    }
    if !duplicates.is_empty() {
        return Err(Error::validation(
            "base_paths",
            format!("saw duplicates in service tables: {}", duplicates.join(", ")),
        ));
    }
    Ok(merged)
}

/// The full compiled-in service table.
pub fn service_table() -> Result<BTreeMap<&'static str, ServiceEndpoint>> {
    merge_tables(PARTIAL_TABLES)
}

// =========================================================================
// mTLS
// =========================================================================

/// Decides whether the environment is configured for mutual TLS.
pub trait MtlsDetector: Send + Sync {
    /// Which of the two candidate endpoints the transport would use.
    fn select_endpoint(&self, regular: &str, mtls: &str) -> Result<String>;
}

/// Run the detector once against the synthetic endpoint.
///
/// A detection failure means "not mTLS"; it never aborts activation.
pub fn detect_mtls(detector: &dyn MtlsDetector) -> bool {
    let candidate = rewrite_for_mtls(MOCK_ENDPOINT);
    match detector.select_endpoint(MOCK_ENDPOINT, &candidate) {
        Ok(chosen) => {
            let mtls = chosen.contains("mtls");
            tracing::info!("mTLS detection selected {} (mtls: {})", chosen, mtls);
            mtls
        }
        Err(e) => {
            tracing::warn!("mTLS detection failed, using regular endpoints: {}", e);
            false
        }
    }
}

/// Fixed answer, for callers that already know.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMtlsDetector(pub bool);

impl MtlsDetector for StaticMtlsDetector {
    fn select_endpoint(&self, regular: &str, mtls: &str) -> Result<String> {
        Ok(if self.0 { mtls } else { regular }.to_string())
    }
}

/// Endpoint selection driven by the client library environment variables.
#[derive(Debug, Clone)]
pub struct EnvMtlsDetector {
    use_mtls_endpoint: Option<String>,
    use_client_certificate: Option<String>,
    cert_source: Option<PathBuf>,
}

impl EnvMtlsDetector {
    pub fn new(env: &Environment) -> Self {
        let cert_source = dirs::home_dir()
            .map(|home| home.join(".secureConnect").join("context_aware_metadata.json"))
            .filter(|path| path.exists());
        Self {
            use_mtls_endpoint: env.get("GOOGLE_API_USE_MTLS_ENDPOINT").map(str::to_string),
            use_client_certificate: env
                .get("GOOGLE_API_USE_CLIENT_CERTIFICATE")
                .map(str::to_string),
            cert_source,
        }
    }

    /// Override the client certificate source location.
    pub fn with_cert_source(mut self, path: Option<PathBuf>) -> Self {
        self.cert_source = path;
        self
    }
}

impl MtlsDetector for EnvMtlsDetector {
    fn select_endpoint(&self, regular: &str, mtls: &str) -> Result<String> {
        let use_cert = match self.use_client_certificate.as_deref() {
            Some(v) => parse_bool("GOOGLE_API_USE_CLIENT_CERTIFICATE", v)?,
            None => false,
        };
        let chosen = match self.use_mtls_endpoint.as_deref().unwrap_or("auto") {
            "always" => mtls,
            "never" => regular,
            "auto" if use_cert && self.cert_source.is_some() => mtls,
            "auto" => regular,
            other => {
                return Err(Error::validation(
                    "GOOGLE_API_USE_MTLS_ENDPOINT",
                    format!("expected always, never or auto, got {other:?}"),
                ))
            }
        };
        Ok(chosen.to_string())
    }
}

/// Insert `.mtls.` after the first host label.
///
/// `https://compute.googleapis.com/compute/v1/` becomes
/// `https://compute.mtls.googleapis.com/compute/v1/`; a single-label host gets
/// `.mtls` appended. Already-rewritten URLs are returned unchanged.
pub fn rewrite_for_mtls(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        if url.contains(".mtls.") {
            return url.to_string();
        }
        return url.replacen(".googleapis", ".mtls.googleapis", 1);
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let (host, port) = match authority.rfind(':') {
        Some(idx) if !authority[idx + 1..].contains('}') => authority.split_at(idx),
        _ => (authority, ""),
    };

    let rewritten = match host.split_once('.') {
        Some((_, tail)) if tail == "mtls" || tail.starts_with("mtls.") => host.to_string(),
        Some((first, tail)) => format!("{first}.mtls.{tail}"),
        None => format!("{host}.mtls"),
    };
    format!("{scheme}://{rewritten}{port}{path}")
}

/// Check a user-supplied override: a URL ending in a version segment and `/`.
pub fn validate_custom_endpoint(field: &str, value: &str) -> Result<()> {
    let well_formed = value
        .strip_suffix('/')
        .and_then(|trimmed| trimmed.rsplit_once('/'))
        .is_some_and(|(_, last)| !last.is_empty());
    if !well_formed {
        return Err(Error::validation(
            field,
            format!("{value:?} must be a URL ending with a version path segment and a trailing slash"),
        ));
    }
    url::Url::parse(value)
        .map_err(|e| Error::validation(field, format!("{value:?} is not a valid URL: {e}")))?;
    Ok(())
}

// =========================================================================
// Base path map
// =========================================================================

/// Immutable per-activation map from service key to base URL.
#[derive(Debug, Clone)]
pub struct BasePaths {
    paths: BTreeMap<&'static str, String>,
    overridden: BTreeSet<&'static str>,
    mtls: bool,
}

impl BasePaths {
    /// Build the map for one activation.
    ///
    /// `overrides` is keyed by override field name (`compute_custom_endpoint`).
    pub fn build(
        overrides: &BTreeMap<String, String>,
        mtls: bool,
        universe_domain: Option<&str>,
    ) -> Result<Self> {
        let table = service_table()?;

        let mut paths = BTreeMap::new();
        for (service, endpoint) in &table {
            let mut base = endpoint.default_base_path.to_string();
            if mtls {
                base = rewrite_for_mtls(&base);
            }
            if let Some(domain) = universe_domain.filter(|d| *d != DEFAULT_UNIVERSE_DOMAIN) {
                base = base.replace(DEFAULT_UNIVERSE_DOMAIN, domain);
            }
            paths.insert(*service, base);
        }

        let mut overridden = BTreeSet::new();
        for (field, value) in overrides {
            let services: Vec<&'static str> = table
                .values()
                .filter(|endpoint| endpoint.field == field)
                .map(|endpoint| endpoint.service)
                .collect();
            if services.is_empty() {
                return Err(Error::validation(field.as_str(), "unknown custom endpoint"));
            }
            validate_custom_endpoint(field, value)?;
            for service in services {
                tracing::debug!("{} base path overridden by {}", service, field);
                paths.insert(service, value.clone());
                overridden.insert(service);
            }
        }

        Ok(Self {
            paths,
            overridden,
            mtls,
        })
    }

    pub fn get(&self, service: &str) -> Option<&str> {
        self.paths.get(service).map(String::as_str)
    }

    /// Like [`BasePaths::get`] but an unknown service is an error.
    pub fn resolve(&self, service: &str) -> Result<&str> {
        self.get(service)
            .ok_or_else(|| Error::validation("service", format!("unknown service {service:?}")))
    }

    pub fn is_overridden(&self, service: &str) -> bool {
        self.overridden.contains(service)
    }

    pub fn is_mtls(&self) -> bool {
        self.mtls
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.paths.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Base path of a single service: the override if given, else the default.
pub fn resolve_base_path(service: &str, override_url: Option<&str>, mtls: bool) -> Result<String> {
    let table = service_table()?;
    let endpoint = table
        .get(service)
        .ok_or_else(|| Error::validation("service", format!("unknown service {service:?}")))?;
    match override_url.filter(|u| !u.is_empty()) {
        Some(url) => {
            validate_custom_endpoint(endpoint.field, url)?;
            Ok(url.to_string())
        }
        None if mtls => Ok(rewrite_for_mtls(endpoint.default_base_path)),
        None => Ok(endpoint.default_base_path.to_string()),
    }
}
