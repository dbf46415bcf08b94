//! Acceptance-pipeline tests: compile -> analyze -> synthesize, driven the
//! way the RGD controller drives them, but without a cluster.

use kro_graph::{analyze, AnalyzeInput, GraphError, Node, OpenSchemaSource};
use kro_operator::crd::{ResourceGraphDefinition, ResourceGraphDefinitionSpec};
use kro_operator::crd_builder::build_instance_crd;
use kro_operator::plan::RgdPlan;
use serde_json::{json, Value};

fn rgd_from(spec: Value) -> ResourceGraphDefinition {
    let spec: ResourceGraphDefinitionSpec = serde_json::from_value(spec).unwrap();
    let mut rgd = ResourceGraphDefinition::new("test-rgd", spec);
    rgd.metadata.uid = Some("uid-test".to_string());
    rgd
}

fn plan_for(rgd: &ResourceGraphDefinition) -> Result<RgdPlan, GraphError> {
    let compiled = kro_schema::compile(
        &rgd.spec.schema.spec,
        &rgd.spec.schema.types,
        &rgd.spec.schema_validations(),
    )
    .expect("schema compiles");
    let definitions: Vec<_> = rgd.spec.resources.iter().map(|r| r.to_definition()).collect();
    let graph = analyze(AnalyzeInput {
        resources: &definitions,
        schema_type: compiled.expr_type.clone(),
        status: &rgd.spec.schema.status,
        source: &OpenSchemaSource,
    })?;
    Ok(RgdPlan {
        rgd_name: "test-rgd".to_string(),
        gvk: rgd.spec.instance_gvk(),
        compiled,
        graph,
        service_accounts: rgd.spec.default_service_accounts.clone(),
    })
}

fn web_application() -> ResourceGraphDefinition {
    rgd_from(json!({
        "schema": {
            "kind": "WebApplication",
            "apiVersion": "v1alpha1",
            "spec": {
                "name": "string | required=true",
                "image": "string | default=nginx",
                "replicas": "integer | default=3"
            },
            "status": {
                "availableReplicas": "${deployment.status.availableReplicas}"
            }
        },
        "resources": [
            {
                "id": "deployment",
                "template": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": "${schema.name}"},
                    "spec": {
                        "replicas": "${schema.replicas}",
                        "selector": {"matchLabels": {"app": "${schema.name}"}},
                        "template": {
                            "metadata": {"labels": {"app": "${schema.name}"}},
                            "spec": {"containers": [
                                {"name": "app", "image": "${schema.image}"}
                            ]}
                        }
                    }
                }
            },
            {
                "id": "service",
                "template": {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": {"name": "${deployment.metadata.name}"},
                    "spec": {
                        "selector": {"app": "${deployment.metadata.name}"},
                        "ports": [{"port": 80}]
                    }
                }
            }
        ]
    }))
}

#[test]
fn linear_deployment_plan() {
    let rgd = web_application();
    let plan = plan_for(&rgd).unwrap();

    // service depends on deployment, so the order is fixed
    assert_eq!(plan.graph.order, vec!["deployment", "service"]);

    // rendering with a defaulted spec produces the expected objects
    let mut spec = json!({"name": "web"});
    kro_schema::apply_defaults(&plan.compiled.spec, &mut spec);
    assert_eq!(spec["image"], json!("nginx"));
    assert_eq!(spec["replicas"], json!(3));

    let mut bindings = kro_expr::Bindings::new();
    bindings.bind("schema", spec);

    let Node::Template(deployment) = &plan.graph.nodes["deployment"].node else {
        panic!("expected template node");
    };
    let rendered = deployment.render(&bindings).unwrap();
    assert_eq!(rendered["metadata"]["name"], json!("web"));
    assert_eq!(rendered["spec"]["replicas"], json!(3));
    assert_eq!(
        rendered["spec"]["template"]["spec"]["containers"][0]["image"],
        json!("nginx")
    );

    // bind the applied deployment, then the service template resolves
    bindings.bind("deployment", rendered);
    let Node::Template(service) = &plan.graph.nodes["service"].node else {
        panic!("expected template node");
    };
    let rendered = service.render(&bindings).unwrap();
    assert_eq!(rendered["metadata"]["name"], json!("web"));
    assert_eq!(rendered["spec"]["selector"]["app"], json!("web"));

    // status projection picks up the live deployment
    bindings.bind(
        "deployment",
        json!({"status": {"availableReplicas": 3}}),
    );
    let status = plan.graph.status.render(&bindings).unwrap();
    assert_eq!(status, json!({"availableReplicas": 3}));
}

#[test]
fn cycle_rejection() {
    let rgd = rgd_from(json!({
        "schema": {"kind": "Cyclic", "apiVersion": "v1alpha1"},
        "resources": [
            {"id": "a", "template": {"apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "${b.metadata.name}"}}},
            {"id": "b", "template": {"apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "${a.metadata.name}"}}}
        ]
    }));
    match plan_for(&rgd) {
        Err(GraphError::Cycle { cycle }) => {
            assert!(cycle.contains("a") && cycle.contains("b"), "{}", cycle);
        }
        other => panic!("expected cycle error, got {:?}", other.map(|p| p.graph.order)),
    }
}

#[test]
fn external_reference_plan() {
    let rgd = rgd_from(json!({
        "schema": {"kind": "Tenant", "apiVersion": "v1alpha1"},
        "resources": [
            {"id": "projectConfig", "externalRef": {
                "apiVersion": "kro.run/v1alpha1",
                "kind": "Project",
                "metadata": {"name": "default-project"}
            }},
            {"id": "ns", "template": {
                "apiVersion": "v1", "kind": "Namespace",
                "metadata": {"name": "${projectConfig.spec.defaultNamespace}"}
            }}
        ]
    }));
    let plan = plan_for(&rgd).unwrap();
    assert_eq!(plan.graph.order, vec!["projectConfig", "ns"]);
    assert!(matches!(
        plan.graph.nodes["projectConfig"].node,
        Node::ExternalRef(_)
    ));
    // the namespace cannot render until the external object is bound
    let Node::Template(ns) = &plan.graph.nodes["ns"].node else {
        panic!("expected template");
    };
    let mut bindings = kro_expr::Bindings::new();
    bindings.bind("schema", json!({}));
    assert!(ns.render(&bindings).unwrap_err().is_missing_data());

    bindings.bind(
        "projectConfig",
        json!({"spec": {"defaultNamespace": "tenant-a"}}),
    );
    let rendered = ns.render(&bindings).unwrap();
    assert_eq!(rendered["metadata"]["name"], json!("tenant-a"));
}

#[test]
fn include_when_gating_compiles_with_dependencies() {
    let rgd = rgd_from(json!({
        "schema": {
            "kind": "GatedApp",
            "apiVersion": "v1alpha1",
            "spec": {"ingress": {"enabled": "boolean | default=false"}}
        },
        "resources": [
            {"id": "deployment", "template": {
                "apiVersion": "apps/v1", "kind": "Deployment",
                "metadata": {"name": "app"}}},
            {"id": "ingress",
             "includeWhen": ["${schema.ingress.enabled}"],
             "template": {
                "apiVersion": "networking.k8s.io/v1", "kind": "Ingress",
                "metadata": {"name": "${deployment.metadata.name}"}}}
        ]
    }));
    let plan = plan_for(&rgd).unwrap();
    assert_eq!(plan.graph.order, vec!["deployment", "ingress"]);
    assert_eq!(plan.graph.nodes["ingress"].include_when.len(), 1);
    assert!(plan
        .graph
        .nodes["ingress"]
        .dependencies
        .contains("deployment"));
}

#[test]
fn synthesized_crd_round_trips_through_json() {
    let rgd = web_application();
    let plan = plan_for(&rgd).unwrap();
    let crd = build_instance_crd(&rgd, &plan);

    // the CRD must survive serialization unchanged (what the API server
    // stores is what analysis produced)
    let bytes = serde_json::to_vec(&crd).unwrap();
    let reparsed: k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition =
        serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reparsed.spec.names.plural, "webapplications");
    assert_eq!(
        serde_json::to_vec(&reparsed).unwrap(),
        bytes,
        "CRD serialization must be stable"
    );
}

#[test]
fn rgd_update_reanalysis_changes_order() {
    // scenario: an Active RGD's resources change; re-analysis publishes a
    // new topological order
    let rgd = web_application();
    let plan = plan_for(&rgd).unwrap();
    assert_eq!(plan.graph.order, vec!["deployment", "service"]);

    let mut updated = rgd.clone();
    updated.spec.resources[1].template = Some(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "standalone"}
    }));
    let new_plan = plan_for(&updated).unwrap();
    // the service no longer references the deployment: both are roots and
    // the tie breaks lexicographically
    assert_eq!(new_plan.graph.order, vec!["deployment", "service"]);
    assert!(new_plan.graph.nodes["service"].dependencies.is_empty());

    // and a broken update fails analysis while the old plan stays valid
    let mut broken = rgd.clone();
    broken.spec.resources[1].template = Some(json!({
        "apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "${nope.metadata.name}"}
    }));
    assert!(plan_for(&broken).is_err());
    assert_eq!(plan.graph.order, vec!["deployment", "service"]);
}
