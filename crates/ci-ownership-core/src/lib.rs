//! Ownership resolution engine: decides which organizational component
//! owns a given test or CI job variant.
//!
//! Components are registered explicitly in a [`Registry`]; the
//! [`TestResolver`] and [`VariantResolver`] query every component,
//! collect claims, and resolve conflicts. Ambiguous ownership is always
//! a hard error, never a silent tie-break.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, error, trace, warn};

pub const DEFAULT_JIRA_PROJECT: &str = "OCPBUGS";
pub const DEFAULT_COMPONENT: &str = "Unknown";
pub const DEFAULT_CAPABILITY: &str = "Other";
pub const DEFAULT_PRODUCT: &str = "OpenShift";

pub const TEST_OWNERSHIP_KIND: &str = "TestOwnership";
pub const VARIANT_MAPPING_KIND: &str = "VariantMapping";
pub const API_VERSION: &str = "v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OwnershipError {
    #[error(
        "suite={suite:?} test={test:?} is claimed by {first}, {second} at priority {priority} \
         - unable to resolve conflict, please use the priority field"
    )]
    Conflict {
        suite: String,
        test: String,
        first: String,
        second: String,
        priority: i64,
    },
    #[error(
        "component {component} is trying to claim variant {variant}, which is already mapped \
         to project {existing_project} component {existing_component}"
    )]
    DuplicateVariant {
        component: String,
        variant: String,
        existing_project: String,
        existing_component: String,
    },
    #[error("identification error: {0}")]
    Identification(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Identity of a test for matching purposes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TestDescriptor {
    pub name: String,
    pub suite: String,
}

impl Display for TestDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.suite, self.name)
    }
}

/// One matching rule belonging to a component. All present conditions
/// are ANDed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ComponentMatcher {
    pub sig: String,
    pub suite: String,
    pub include_substrings: Vec<String>,
    pub exclude_substrings: Vec<String>,

    pub jira_component: String,
    pub capabilities: Vec<String>,
    pub priority: i64,
}

impl ComponentMatcher {
    #[must_use]
    pub fn is_suite_test(&self, test: &TestDescriptor) -> bool {
        test.suite == self.suite
    }

    /// True when every include-substring is present in the test name.
    /// The exclude check in [`ComponentConfig::find_match`] negates this
    /// same evaluator; it does not look at `exclude_substrings`. That
    /// asymmetry is longstanding observed behavior and is kept as-is.
    #[must_use]
    pub fn is_substring_test(&self, test: &TestDescriptor) -> bool {
        self.include_substrings
            .iter()
            .all(|needle| test.name.contains(needle))
    }
}

/// Declarative configuration for a component: its matching rules,
/// operator list, rename table, and claimed variant identities. Rule
/// catalogs are data, so this deserializes from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ComponentConfig {
    pub name: String,
    pub default_jira_component: String,
    pub jira_project: String,
    pub operators: Vec<String>,
    pub matchers: Vec<ComponentMatcher>,
    pub test_renames: BTreeMap<String, String>,
    pub variants: Vec<String>,
}

impl ComponentConfig {
    /// Finds the first rule claiming this test, if any.
    ///
    /// Operator-health tests take precedence over declared matchers; a
    /// synthesized rule carrying the default JIRA component and the
    /// operator capability tags is returned for them.
    #[must_use]
    pub fn find_match(&self, test: &TestDescriptor) -> Option<ComponentMatcher> {
        if let Some(capabilities) = self.operator_test_capabilities(test) {
            return Some(ComponentMatcher {
                jira_component: self.default_jira_component.clone(),
                capabilities,
                ..ComponentMatcher::default()
            });
        }

        for matcher in &self.matchers {
            let sig_match = matcher.sig.is_empty() || is_sig_test(&test.name, &matcher.sig);
            let suite_match = matcher.suite.is_empty() || matcher.is_suite_test(test);
            let include_match =
                matcher.include_substrings.is_empty() || matcher.is_substring_test(test);
            let exclude_match =
                matcher.exclude_substrings.is_empty() || !matcher.is_substring_test(test);

            if sig_match && suite_match && include_match && exclude_match {
                return Some(matcher.clone());
            }
        }

        None
    }

    fn operator_test_capabilities(&self, test: &TestDescriptor) -> Option<Vec<String>> {
        self.operators
            .iter()
            .find_map(|operator| identify_operator_test(operator, &test.name))
    }
}

/// True when the test name carries the bracketed special interest group
/// marker, e.g. `[sig-network]`.
#[must_use]
pub fn is_sig_test(test_name: &str, sig: &str) -> bool {
    test_name.contains(&format!("[{sig}]"))
}

/// Recognizes operator-health tests for a named operator and returns
/// their capability tags.
#[must_use]
pub fn identify_operator_test(operator: &str, test_name: &str) -> Option<Vec<String>> {
    if test_name.contains(&format!("operator conditions {operator}")) {
        return Some(vec![
            "Operator Conditions".to_string(),
            "Operator Health".to_string(),
        ]);
    }

    if test_name.contains(&format!("clusteroperator/{operator}")) {
        return Some(vec!["Operator Health".to_string()]);
    }

    None
}

/// Rename-resistant identifier derived from the test suite and the
/// component-chosen stable name.
#[must_use]
pub fn stable_id(test: &TestDescriptor, stable_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(test.suite.as_bytes());
    hasher.update(b":");
    hasher.update(stable_name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Versioned ownership record for a single test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestOwnership {
    pub id: String,
    pub name: String,
    pub suite: String,
    pub component: String,
    pub jira_component: String,
    pub jira_component_id: Option<i64>,
    pub capabilities: Vec<String>,
    pub priority: i64,
    pub product: String,
    pub kind: String,
    pub api_version: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    pub staff_approved_obsolete: bool,
}

/// Ownership record for one CI job variant (`category:value`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantMapping {
    pub variant_category: String,
    pub variant_value: String,
    pub jira_project: String,
    pub jira_component: String,
    pub product: String,
    pub kind: String,
    pub api_version: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl VariantMapping {
    /// Identity string shared with the analytical table's latest view.
    #[must_use]
    pub fn variant(&self) -> String {
        format!("{}:{}", self.variant_category, self.variant_value)
    }
}

/// Capability set every registered component exposes.
pub trait Component {
    fn name(&self) -> &str;

    fn jira_project(&self) -> &str;

    /// Non-empty JIRA component names this component may assign. A
    /// component with none is excluded from variant output.
    fn jira_components(&self) -> Vec<String>;

    /// Claims a test, abstains with `None`, or fails.
    ///
    /// # Errors
    /// Returns [`OwnershipError`] when rule evaluation itself fails.
    fn identify_test(&self, test: &TestDescriptor)
        -> Result<Option<TestOwnership>, OwnershipError>;

    /// Claimed variant identities in `category:value` form.
    ///
    /// # Errors
    /// Returns [`OwnershipError`] when variant enumeration fails.
    fn identify_variants(&self) -> Result<Vec<String>, OwnershipError>;

    /// The stable name for a test, consulting the rename table so ids
    /// survive renames.
    fn stable_name(&self, test: &TestDescriptor) -> String;
}

impl Component for ComponentConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn jira_project(&self) -> &str {
        &self.jira_project
    }

    fn jira_components(&self) -> Vec<String> {
        let mut components = Vec::new();
        if !self.default_jira_component.is_empty() {
            components.push(self.default_jira_component.clone());
        }
        for matcher in &self.matchers {
            if !matcher.jira_component.is_empty() {
                components.push(matcher.jira_component.clone());
            }
        }
        components
    }

    fn identify_test(
        &self,
        test: &TestDescriptor,
    ) -> Result<Option<TestOwnership>, OwnershipError> {
        let Some(matcher) = self.find_match(test) else {
            return Ok(None);
        };

        let jira_component = if matcher.jira_component.is_empty() {
            self.default_jira_component.clone()
        } else {
            matcher.jira_component
        };

        Ok(Some(TestOwnership {
            name: test.name.clone(),
            component: self.name.clone(),
            jira_component,
            priority: matcher.priority,
            capabilities: matcher.capabilities,
            ..TestOwnership::default()
        }))
    }

    fn identify_variants(&self) -> Result<Vec<String>, OwnershipError> {
        Ok(self.variants.clone())
    }

    fn stable_name(&self, test: &TestDescriptor) -> String {
        match self.test_renames.get(&test.name) {
            Some(stable) => stable.clone(),
            None => test.name.clone(),
        }
    }
}

/// Fixed set of known components, built explicitly at startup.
pub struct Registry {
    components: Vec<Box<dyn Component>>,
}

impl Registry {
    #[must_use]
    pub fn new(components: Vec<Box<dyn Component>>) -> Self {
        Self { components }
    }

    #[must_use]
    pub fn from_configs(configs: Vec<ComponentConfig>) -> Self {
        Self {
            components: configs
                .into_iter()
                .map(|config| Box::new(config) as Box<dyn Component>)
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Component> {
        self.components.iter().map(|component| &**component)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Classifier for tests staff have approved as obsolete. External
/// collaborator; the default implementation approves nothing.
pub trait ObsoleteTests {
    fn is_obsolete(&self, test: &TestDescriptor) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoObsoleteTests;

impl ObsoleteTests for NoObsoleteTests {
    fn is_obsolete(&self, _test: &TestDescriptor) -> bool {
        false
    }
}

/// Outcome of a full resolution run over a test corpus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionStats {
    pub matched: usize,
    pub unmatched: usize,
}

/// Resolves test ownership against every registered component.
pub struct TestResolver<'a> {
    registry: &'a Registry,
    component_ids: BTreeMap<String, i64>,
}

impl<'a> TestResolver<'a> {
    #[must_use]
    pub fn new(registry: &'a Registry, component_ids: BTreeMap<String, i64>) -> Self {
        Self {
            registry,
            component_ids,
        }
    }

    /// Produces exactly one ownership record for the test.
    ///
    /// # Errors
    /// Returns [`OwnershipError::Conflict`] when two components claim
    /// the test at the same maximum priority, and propagates any
    /// component evaluation error.
    pub fn identify(&self, test: &TestDescriptor) -> Result<TestOwnership, OwnershipError> {
        debug!(
            name = %test.name,
            suite = %test.suite,
            components = self.registry.len(),
            "attempting to identify test"
        );

        let mut claims = Vec::new();
        for component in self.registry.iter() {
            trace!(component = component.name(), "checking component");
            let claim = component.identify_test(test).map_err(|err| {
                error!(component = component.name(), %err, "component returned an error");
                err
            })?;
            if let Some(ownership) = claim {
                trace!(component = component.name(), "component claimed this test");
                claims.push(self.set_defaults(test, ownership, Some(component)));
            }
        }

        if claims.is_empty() {
            claims.push(self.set_defaults(
                test,
                TestOwnership {
                    id: stable_id(test, &test.name),
                    name: test.name.clone(),
                    ..TestOwnership::default()
                },
                None,
            ));
        }

        let mut winner = highest_priority(claims)?;

        let unique: BTreeSet<String> = winner.capabilities.drain(..).collect();
        winner.capabilities = unique.into_iter().collect();

        Ok(winner)
    }

    /// Resolves a whole corpus, stamping the generation timestamp and
    /// the obsolete flag on every record. Per-test failures are logged
    /// and skipped, but any failure makes the batch fail at the end.
    ///
    /// # Errors
    /// Returns [`OwnershipError::Identification`] when one or more tests
    /// could not be identified.
    pub fn identify_all(
        &self,
        tests: &[TestDescriptor],
        created_at: OffsetDateTime,
        obsolete: &dyn ObsoleteTests,
    ) -> Result<(Vec<TestOwnership>, ResolutionStats), OwnershipError> {
        let mut mappings = Vec::with_capacity(tests.len());
        let mut stats = ResolutionStats {
            matched: 0,
            unmatched: 0,
        };
        let mut failed = false;

        for test in tests {
            match self.identify(test) {
                Ok(mut ownership) => {
                    if ownership.component == DEFAULT_COMPONENT {
                        stats.unmatched += 1;
                    } else {
                        stats.matched += 1;
                    }
                    ownership.created_at = Some(created_at);
                    ownership.staff_approved_obsolete = obsolete.is_obsolete(test);
                    mappings.push(ownership);
                }
                Err(err) => {
                    warn!(%err, "encountered error in component identification");
                    failed = true;
                }
            }
        }

        if failed {
            return Err(OwnershipError::Identification(
                "encountered errors while trying to identify tests".to_string(),
            ));
        }

        mappings.sort_by(|lhs, rhs| {
            lhs.name
                .cmp(&rhs.name)
                .then_with(|| lhs.suite.cmp(&rhs.suite))
        });

        Ok((mappings, stats))
    }

    fn set_defaults(
        &self,
        test: &TestDescriptor,
        mut ownership: TestOwnership,
        component: Option<&dyn Component>,
    ) -> TestOwnership {
        if ownership.id.is_empty() {
            if let Some(component) = component {
                ownership.id = stable_id(test, &component.stable_name(test));
            }
        }

        ownership.kind = TEST_OWNERSHIP_KIND.to_string();
        ownership.api_version = API_VERSION.to_string();

        if ownership.product.is_empty() {
            ownership.product = DEFAULT_PRODUCT.to_string();
        }

        if ownership.component.is_empty() {
            ownership.component = DEFAULT_COMPONENT.to_string();
        }

        if ownership.jira_component.is_empty() {
            ownership.jira_component = DEFAULT_COMPONENT.to_string();
        }

        if let Some(id) = self.component_ids.get(&ownership.jira_component) {
            ownership.jira_component_id = Some(*id);
        }

        if ownership.capabilities.is_empty() {
            ownership.capabilities = vec![DEFAULT_CAPABILITY.to_string()];
        }

        if ownership.suite.is_empty() {
            ownership.suite = test.suite.clone();
        }

        ownership
    }
}

fn highest_priority(claims: Vec<TestOwnership>) -> Result<TestOwnership, OwnershipError> {
    let Some(max_priority) = claims.iter().map(|claim| claim.priority).max() else {
        return Err(OwnershipError::Identification(
            "no ownership claims to resolve".to_string(),
        ));
    };

    let mut at_max = claims
        .into_iter()
        .filter(|claim| claim.priority == max_priority);

    let Some(winner) = at_max.next() else {
        return Err(OwnershipError::Identification(
            "no ownership claims to resolve".to_string(),
        ));
    };

    if let Some(contender) = at_max.next() {
        return Err(OwnershipError::Conflict {
            suite: winner.suite,
            test: winner.name,
            first: winner.component,
            second: contender.component,
            priority: max_priority,
        });
    }

    Ok(winner)
}

/// Maps CI job variants to JIRA projects and components.
pub struct VariantResolver<'a> {
    registry: &'a Registry,
}

impl<'a> VariantResolver<'a> {
    #[must_use]
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Builds the variant ownership table across all components.
    ///
    /// # Errors
    /// Returns [`OwnershipError::DuplicateVariant`] when two components
    /// claim the same identity, and propagates component errors.
    pub fn identify(&self) -> Result<Vec<VariantMapping>, OwnershipError> {
        debug!(
            components = self.registry.len(),
            "attempting to map variants to jira"
        );

        let mut variant_to_mapping: BTreeMap<String, VariantMapping> = BTreeMap::new();
        for component in self.registry.iter() {
            trace!(component = component.name(), "checking component");
            let variants = component.identify_variants().map_err(|err| {
                error!(component = component.name(), %err, "component returned an error");
                err
            })?;

            for variant in variants {
                if let Some(existing) = variant_to_mapping.get(&variant) {
                    return Err(OwnershipError::DuplicateVariant {
                        component: component.name().to_string(),
                        variant,
                        existing_project: existing.jira_project.clone(),
                        existing_component: existing.jira_component.clone(),
                    });
                }

                let mut parts = variant.split(':');
                let (Some(category), Some(value), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    error!(%variant, "incorrect format for variant");
                    continue;
                };

                let jira_components = component.jira_components();
                let Some(jira_component) = jira_components.first() else {
                    continue;
                };

                variant_to_mapping.insert(
                    variant.clone(),
                    set_variant_defaults(VariantMapping {
                        variant_category: category.to_string(),
                        variant_value: value.to_string(),
                        jira_project: component.jira_project().to_string(),
                        jira_component: jira_component.clone(),
                        product: String::new(),
                        kind: String::new(),
                        api_version: String::new(),
                        created_at: None,
                    }),
                );
            }
        }

        let mut mappings: Vec<VariantMapping> = variant_to_mapping.into_values().collect();
        mappings.sort_by(|lhs, rhs| {
            lhs.variant_category
                .cmp(&rhs.variant_category)
                .then_with(|| lhs.variant_value.cmp(&rhs.variant_value))
        });

        Ok(mappings)
    }
}

fn set_variant_defaults(mut mapping: VariantMapping) -> VariantMapping {
    mapping.kind = VARIANT_MAPPING_KIND.to_string();
    mapping.api_version = API_VERSION.to_string();

    if mapping.product.is_empty() {
        mapping.product = DEFAULT_PRODUCT.to_string();
    }

    if mapping.jira_component.is_empty() {
        mapping.jira_component = DEFAULT_COMPONENT.to_string();
    }

    if mapping.jira_project.is_empty() {
        mapping.jira_project = DEFAULT_JIRA_PROJECT.to_string();
    }

    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    fn descriptor(name: &str, suite: &str) -> TestDescriptor {
        TestDescriptor {
            name: name.to_string(),
            suite: suite.to_string(),
        }
    }

    fn component(name: &str, matchers: Vec<ComponentMatcher>) -> ComponentConfig {
        ComponentConfig {
            name: name.to_string(),
            default_jira_component: name.to_string(),
            jira_project: DEFAULT_JIRA_PROJECT.to_string(),
            matchers,
            ..ComponentConfig::default()
        }
    }

    fn registry(configs: Vec<ComponentConfig>) -> Registry {
        Registry::from_configs(configs)
    }

    #[test]
    fn single_claim_wins_with_declared_priority_and_capabilities() {
        let reg = registry(vec![component(
            "Networking",
            vec![ComponentMatcher {
                sig: "sig-network".to_string(),
                capabilities: vec!["DNS".to_string(), "Routing".to_string(), "DNS".to_string()],
                priority: 2,
                ..ComponentMatcher::default()
            }],
        )]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let ownership = must_ok(resolver.identify(&descriptor(
            "[sig-network] pods should resolve DNS",
            "conformance",
        )));

        assert_eq!(ownership.component, "Networking");
        assert_eq!(ownership.jira_component, "Networking");
        assert_eq!(ownership.priority, 2);
        assert_eq!(ownership.capabilities, vec!["DNS", "Routing"]);
        assert_eq!(ownership.suite, "conformance");
        assert_eq!(ownership.kind, TEST_OWNERSHIP_KIND);
        assert_eq!(ownership.api_version, API_VERSION);
    }

    #[test]
    fn unclaimed_test_gets_unknown_defaults() {
        let reg = registry(vec![]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let ownership = must_ok(resolver.identify(&descriptor("no one wants me", "orphans")));

        assert_eq!(ownership.component, DEFAULT_COMPONENT);
        assert_eq!(ownership.jira_component, DEFAULT_COMPONENT);
        assert_eq!(ownership.capabilities, vec![DEFAULT_CAPABILITY]);
        assert_eq!(ownership.product, DEFAULT_PRODUCT);
        assert!(!ownership.id.is_empty());
    }

    #[test]
    fn equal_max_priority_is_a_conflict_naming_both_components() {
        let matcher = ComponentMatcher {
            include_substrings: vec!["etcd".to_string()],
            ..ComponentMatcher::default()
        };
        let reg = registry(vec![
            component("Etcd", vec![matcher.clone()]),
            component("Control Plane", vec![matcher]),
        ]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let err = must_err(resolver.identify(&descriptor("etcd leader changes", "disruptive")));
        match err {
            OwnershipError::Conflict { first, second, .. } => {
                assert_eq!(first, "Etcd");
                assert_eq!(second, "Control Plane");
            }
            other => panic!("expected conflict error, got: {other}"),
        }
    }

    #[test]
    fn higher_priority_beats_lower_priority_claim() {
        let reg = registry(vec![
            component(
                "A",
                vec![ComponentMatcher {
                    sig: "sig-network".to_string(),
                    ..ComponentMatcher::default()
                }],
            ),
            component(
                "B",
                vec![ComponentMatcher {
                    suite: "X".to_string(),
                    priority: 1,
                    ..ComponentMatcher::default()
                }],
            ),
        ]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let ownership =
            must_ok(resolver.identify(&descriptor("[sig-network] service reachability", "X")));
        assert_eq!(ownership.component, "B");
        assert_eq!(ownership.priority, 1);
    }

    #[test]
    fn tie_below_the_maximum_does_not_conflict() {
        let matcher = ComponentMatcher {
            include_substrings: vec!["upgrade".to_string()],
            ..ComponentMatcher::default()
        };
        let mut high = component(
            "Winner",
            vec![ComponentMatcher {
                include_substrings: vec!["upgrade".to_string()],
                priority: 5,
                ..ComponentMatcher::default()
            }],
        );
        high.default_jira_component = "Winner".to_string();

        let reg = registry(vec![
            component("LowA", vec![matcher.clone()]),
            component("LowB", vec![matcher]),
            high,
        ]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let ownership = must_ok(resolver.identify(&descriptor("upgrade should work", "upgrade")));
        assert_eq!(ownership.component, "Winner");
    }

    #[test]
    fn first_matching_rule_wins_within_a_component() {
        let reg = registry(vec![component(
            "Storage",
            vec![
                ComponentMatcher {
                    include_substrings: vec!["volume".to_string()],
                    jira_component: "Storage / CSI".to_string(),
                    ..ComponentMatcher::default()
                },
                ComponentMatcher {
                    include_substrings: vec!["volume".to_string()],
                    jira_component: "Storage / Operators".to_string(),
                    priority: 9,
                    ..ComponentMatcher::default()
                },
            ],
        )]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let ownership = must_ok(resolver.identify(&descriptor("volume expansion", "storage")));
        assert_eq!(ownership.jira_component, "Storage / CSI");
        assert_eq!(ownership.priority, 0);
    }

    #[test]
    fn exclude_substrings_reuse_the_include_evaluator() {
        // A matcher with both include and exclude sets can never match:
        // the exclude check negates the include-substring evaluator
        // itself. This mirrors observed production behavior.
        let config = component(
            "Networking",
            vec![ComponentMatcher {
                include_substrings: vec!["ovn".to_string()],
                exclude_substrings: vec!["windows".to_string()],
                ..ComponentMatcher::default()
            }],
        );

        assert!(config
            .find_match(&descriptor("ovn pod networking", "network"))
            .is_none());
    }

    #[test]
    fn exclude_only_matcher_rejects_tests_containing_all_includes() {
        let config = component(
            "Networking",
            vec![ComponentMatcher {
                exclude_substrings: vec!["anything".to_string()],
                ..ComponentMatcher::default()
            }],
        );

        // Empty include set means is_substring_test is vacuously true,
        // so the negated check rejects every test.
        assert!(config
            .find_match(&descriptor("some test", "network"))
            .is_none());
    }

    #[test]
    fn operator_test_takes_precedence_over_matchers() {
        let mut config = component(
            "Etcd",
            vec![ComponentMatcher {
                include_substrings: vec!["operator conditions".to_string()],
                jira_component: "Etcd / Matcher".to_string(),
                priority: 3,
                ..ComponentMatcher::default()
            }],
        );
        config.operators = vec!["etcd".to_string()];
        config.default_jira_component = "Etcd".to_string();

        let matched =
            match config.find_match(&descriptor("operator conditions etcd", "operators")) {
                Some(matcher) => matcher,
                None => panic!("expected operator test to match"),
            };

        assert_eq!(matched.jira_component, "Etcd");
        assert_eq!(matched.priority, 0);
        assert!(matched
            .capabilities
            .contains(&"Operator Health".to_string()));
    }

    #[test]
    fn renamed_test_keeps_its_stable_id() {
        let mut config = component(
            "Networking",
            vec![ComponentMatcher {
                include_substrings: vec!["name".to_string()],
                ..ComponentMatcher::default()
            }],
        );
        config
            .test_renames
            .insert("new-name".to_string(), "old-name".to_string());
        let reg = registry(vec![config]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());

        let before = must_ok(resolver.identify(&descriptor("old-name", "suite")));
        let after = must_ok(resolver.identify(&descriptor("new-name", "suite")));

        assert_eq!(before.id, after.id);
        assert_ne!(before.name, after.name);
    }

    #[test]
    fn jira_component_id_is_looked_up_best_effort() {
        let mut ids = BTreeMap::new();
        ids.insert("Networking".to_string(), 12345_i64);
        let reg = registry(vec![component(
            "Networking",
            vec![ComponentMatcher {
                include_substrings: vec!["dns".to_string()],
                ..ComponentMatcher::default()
            }],
        )]);
        let resolver = TestResolver::new(&reg, ids);

        let owned = must_ok(resolver.identify(&descriptor("dns lookup", "network")));
        assert_eq!(owned.jira_component_id, Some(12345));

        let unknown = must_ok(resolver.identify(&descriptor("no match here", "network")));
        assert_eq!(unknown.jira_component_id, None);
    }

    #[test]
    fn batch_resolution_is_fail_closed_but_not_fail_fast() {
        struct FailingComponent;

        impl Component for FailingComponent {
            fn name(&self) -> &str {
                "Broken"
            }
            fn jira_project(&self) -> &str {
                DEFAULT_JIRA_PROJECT
            }
            fn jira_components(&self) -> Vec<String> {
                vec!["Broken".to_string()]
            }
            fn identify_test(
                &self,
                test: &TestDescriptor,
            ) -> Result<Option<TestOwnership>, OwnershipError> {
                if test.name.contains("poison") {
                    return Err(OwnershipError::Identification(
                        "rule evaluation failed".to_string(),
                    ));
                }
                Ok(None)
            }
            fn identify_variants(&self) -> Result<Vec<String>, OwnershipError> {
                Ok(Vec::new())
            }
            fn stable_name(&self, test: &TestDescriptor) -> String {
                test.name.clone()
            }
        }

        let reg = Registry::new(vec![Box::new(FailingComponent)]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());
        let tests = vec![
            descriptor("fine test", "suite"),
            descriptor("poison test", "suite"),
            descriptor("another fine test", "suite"),
        ];

        let err = must_err(resolver.identify_all(
            &tests,
            OffsetDateTime::UNIX_EPOCH,
            &NoObsoleteTests,
        ));
        match err {
            OwnershipError::Identification(message) => {
                assert!(message.contains("identify tests"));
            }
            other => panic!("expected identification error, got: {other}"),
        }
    }

    #[test]
    fn batch_output_is_sorted_by_name_then_suite() {
        let reg = registry(vec![]);
        let resolver = TestResolver::new(&reg, BTreeMap::new());
        let tests = vec![
            descriptor("b", "2"),
            descriptor("a", "2"),
            descriptor("a", "1"),
        ];

        let (mappings, stats) = must_ok(resolver.identify_all(
            &tests,
            OffsetDateTime::UNIX_EPOCH,
            &NoObsoleteTests,
        ));

        let keys: Vec<(String, String)> = mappings
            .iter()
            .map(|item| (item.name.clone(), item.suite.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(stats.unmatched, 3);
        assert_eq!(stats.matched, 0);
        assert!(mappings.iter().all(|item| item.created_at.is_some()));
    }

    #[test]
    fn variant_resolution_sorts_and_applies_defaults() {
        let mut networking = component("Networking", vec![]);
        networking.variants = vec![
            "Network:ovn".to_string(),
            "Network:sdn".to_string(),
            "Architecture:arm64".to_string(),
        ];
        let reg = registry(vec![networking]);
        let resolver = VariantResolver::new(&reg);

        let mappings = must_ok(resolver.identify());
        let identities: Vec<String> = mappings.iter().map(VariantMapping::variant).collect();
        assert_eq!(
            identities,
            vec!["Architecture:arm64", "Network:ovn", "Network:sdn"]
        );
        for mapping in &mappings {
            assert_eq!(mapping.kind, VARIANT_MAPPING_KIND);
            assert_eq!(mapping.api_version, API_VERSION);
            assert_eq!(mapping.product, DEFAULT_PRODUCT);
            assert_eq!(mapping.jira_project, DEFAULT_JIRA_PROJECT);
        }
    }

    #[test]
    fn duplicate_variant_claim_is_fatal() {
        let mut first = component("First", vec![]);
        first.variants = vec!["Platform:aws".to_string()];
        let mut second = component("Second", vec![]);
        second.variants = vec!["Platform:aws".to_string()];
        let reg = registry(vec![first, second]);
        let resolver = VariantResolver::new(&reg);

        let err = must_err(resolver.identify());
        match err {
            OwnershipError::DuplicateVariant {
                component,
                variant,
                existing_component,
                ..
            } => {
                assert_eq!(component, "Second");
                assert_eq!(variant, "Platform:aws");
                assert_eq!(existing_component, "First");
            }
            other => panic!("expected duplicate variant error, got: {other}"),
        }
    }

    #[test]
    fn malformed_variant_identities_are_skipped_not_fatal() {
        let mut config = component("Networking", vec![]);
        config.variants = vec![
            "justonepart".to_string(),
            "too:many:parts".to_string(),
            "Network:ovn".to_string(),
        ];
        let reg = registry(vec![config]);
        let resolver = VariantResolver::new(&reg);

        let mappings = must_ok(resolver.identify());
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].variant(), "Network:ovn");
    }

    #[test]
    fn components_without_jira_components_are_excluded_from_variants() {
        let mut config = component("Quiet", vec![]);
        config.default_jira_component = String::new();
        config.variants = vec!["Platform:gcp".to_string()];
        let reg = registry(vec![config]);
        let resolver = VariantResolver::new(&reg);

        let mappings = must_ok(resolver.identify());
        assert!(mappings.is_empty());
    }

    #[test]
    fn component_config_round_trips_through_json() {
        let raw = r#"{
            "name": "Networking",
            "default_jira_component": "Networking / router",
            "operators": ["dns"],
            "matchers": [
                {"sig": "sig-network", "priority": 1},
                {"suite": "router scenarios"}
            ],
            "test_renames": {"new": "old"},
            "variants": ["Network:ovn"]
        }"#;

        let config: ComponentConfig = must_ok(serde_json::from_str(raw));
        assert_eq!(config.name, "Networking");
        assert_eq!(config.matchers.len(), 2);
        assert_eq!(config.matchers[0].priority, 1);
        assert!(config.jira_project.is_empty());
        assert_eq!(config.test_renames.get("new"), Some(&"old".to_string()));
    }

    #[test]
    fn stable_id_depends_on_suite_and_stable_name() {
        let test = descriptor("a test", "suite-one");
        let same = stable_id(&test, "a test");
        assert_eq!(stable_id(&test, "a test"), same);
        assert_ne!(stable_id(&descriptor("a test", "suite-two"), "a test"), same);
        assert_ne!(stable_id(&test, "another name"), same);
    }
}
