//! Property-based tests using proptest
//!
//! These tests verify value precedence, region/zone shortening, boolean
//! parsing and the mTLS endpoint rewrite using randomized inputs.

use std::collections::BTreeMap;

use gcp_provider_core::config::resolver::{self, parse_bool, region_from_self_link, FieldSpec, Source};
use gcp_provider_core::config::{Environment, ProviderBlock, ResolvedConfig};
use gcp_provider_core::gcp::endpoints::{rewrite_for_mtls, BasePaths, StaticMtlsDetector};
use proptest::prelude::*;

const PROJECT_VARS: [&str; 4] = [
    "GOOGLE_PROJECT",
    "GOOGLE_CLOUD_PROJECT",
    "GCLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
];

/// Generate a plausible project id
fn arb_project() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{4,28}[a-z0-9]"
}

/// Generate values for the project variables, each possibly unset or empty
fn arb_env_values() -> impl Strategy<Value = Vec<Option<String>>> {
    prop::collection::vec(
        prop_oneof![
            Just(None),
            Just(Some(String::new())),
            arb_project().prop_map(Some),
        ],
        PROJECT_VARS.len(),
    )
}

fn env_from(values: &[Option<String>]) -> Environment {
    Environment::from_pairs(
        PROJECT_VARS
            .iter()
            .zip(values)
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone()))),
    )
}

/// Pick any field that can be read from the environment
fn arb_env_field() -> impl Strategy<Value = FieldSpec> {
    prop::sample::select(vec![
        resolver::CREDENTIALS,
        resolver::ACCESS_TOKEN,
        resolver::IMPERSONATE_SERVICE_ACCOUNT,
        resolver::PROJECT,
        resolver::REGION,
        resolver::ZONE,
        resolver::BILLING_PROJECT,
        resolver::USER_PROJECT_OVERRIDE,
        resolver::REQUEST_REASON,
    ])
}

/// A field together with values for each of its variables
fn arb_field_with_env() -> impl Strategy<Value = (FieldSpec, Vec<Option<String>>)> {
    arb_env_field().prop_flat_map(|field| {
        let values = prop::collection::vec(
            prop_oneof![
                Just(None),
                Just(Some(String::new())),
                "[a-z0-9./-]{1,20}".prop_map(Some),
            ],
            field.env.len(),
        );
        (Just(field), values)
    })
}

/// Generate a host name under googleapis.com
fn arb_api_url() -> impl Strategy<Value = String> {
    ("[a-z]{2,12}", "v[1-3]", prop::option::of(":[0-9]{3,4}"))
        .prop_map(|(service, version, port)| {
            format!(
                "https://{}.googleapis.com{}/{}/",
                service,
                port.unwrap_or_default(),
                version
            )
        })
}

proptest! {
    /// A non-empty config value beats every environment variable
    #[test]
    fn prop_config_beats_environment(config in arb_project(), env_values in arb_env_values()) {
        let env = env_from(&env_values);
        let resolved = resolver::resolve(&resolver::PROJECT, Some(&config), &env, None).unwrap();
        prop_assert_eq!(resolved.value.as_deref(), Some(config.as_str()));
        prop_assert_eq!(resolved.source, Source::Config);
    }

    /// The same holds for every field with environment variables
    #[test]
    fn prop_config_beats_environment_for_every_field(
        (field, env_values) in arb_field_with_env(),
        config in "[a-z0-9][a-z0-9./-]{0,20}",
    ) {
        let env = Environment::from_pairs(
            field
                .env
                .iter()
                .zip(&env_values)
                .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone()))),
        );
        let resolved = resolver::resolve(&field, Some(&config), &env, None).unwrap();
        prop_assert_eq!(resolved.value.as_deref(), Some(config.as_str()), "field {}", field.name);
        prop_assert_eq!(resolved.source, Source::Config);
    }

    /// Without config, the first non-empty variable in precedence order wins
    #[test]
    fn prop_first_non_empty_variable_wins(env_values in arb_env_values()) {
        let env = env_from(&env_values);
        let resolved = resolver::resolve(&resolver::PROJECT, None, &env, None).unwrap();
        let expected = env_values
            .iter()
            .position(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
        match expected {
            Some(index) => {
                prop_assert_eq!(resolved.value.as_deref(), env_values[index].as_deref());
                prop_assert_eq!(resolved.source, Source::Env { index, name: PROJECT_VARS[index] });
            }
            None => {
                prop_assert_eq!(resolved.value, None);
                prop_assert_eq!(resolved.source, Source::Unset);
            }
        }
    }

    /// An explicitly empty project never falls through to the environment
    #[test]
    fn prop_empty_project_is_rejected(env_values in arb_env_values()) {
        let env = env_from(&env_values);
        prop_assert!(resolver::resolve(&resolver::PROJECT, Some(""), &env, None).is_err());
    }

    /// A region self-link is shortened, the same zone self-link is not
    #[test]
    fn prop_region_shortened_zone_verbatim(
        project in arb_project(),
        region in "[a-z]{4,10}-[a-z]{4,9}[1-9]",
    ) {
        let region_link = format!(
            "https://www.googleapis.com/compute/v1/projects/{}/regions/{}",
            project, region
        );
        let zone_link = format!(
            "https://www.googleapis.com/compute/v1/projects/{}/zones/{}-a",
            project, region
        );
        prop_assert_eq!(region_from_self_link(&region_link), region.clone());

        let block = ProviderBlock {
            region: Some(region_link),
            zone: Some(zone_link.clone()),
            ..Default::default()
        };
        let config = ResolvedConfig::resolve(&block, &Environment::empty(), &StaticMtlsDetector(false)).unwrap();
        prop_assert_eq!(config.region(), Some(region.as_str()));
        prop_assert_eq!(config.zone(), Some(zone_link.as_str()));
    }

    /// Only the documented boolean literals parse
    #[test]
    fn prop_bool_literals(value in "[a-zA-Z0-9]{0,6}") {
        let known_true = ["1", "t", "T", "TRUE", "true", "True"];
        let known_false = ["0", "f", "F", "FALSE", "false", "False"];
        let parsed = parse_bool("user_project_override", &value);
        if known_true.contains(&value.as_str()) {
            prop_assert_eq!(parsed.unwrap(), true);
        } else if known_false.contains(&value.as_str()) {
            prop_assert_eq!(parsed.unwrap(), false);
        } else {
            prop_assert!(parsed.is_err());
        }
    }

    /// The mTLS rewrite is idempotent and inserts after the first label
    #[test]
    fn prop_mtls_rewrite_idempotent(url in arb_api_url()) {
        let once = rewrite_for_mtls(&url);
        prop_assert!(once.contains(".mtls.googleapis.com"));
        prop_assert_eq!(rewrite_for_mtls(&once), once.clone());
        prop_assert_eq!(once.matches(".mtls.").count(), 1);
    }

    /// Default base paths are rewritten all together or not at all
    #[test]
    fn prop_mtls_all_or_none(mtls in any::<bool>()) {
        let paths = BasePaths::build(&BTreeMap::new(), mtls, None).unwrap();
        let rewritten = paths.iter().filter(|(_, url)| url.contains(".mtls.")).count();
        if mtls {
            prop_assert_eq!(rewritten, paths.len());
        } else {
            prop_assert_eq!(rewritten, 0);
        }
    }
}
