use aquila_bootstrap::plan::BootstrapPlan;

/// The platform plan used by the end-to-end tests: three infrastructure
/// backends, one gated application service, the billing topology, and the
/// subscription seed catalogue.
pub const PLATFORM_PLAN_YAML: &str = r#"
api_version: v1
services:
  - name: postgres
    kind: infrastructure
    readiness:
      check: postgres
      interval: 2s
      max_attempts: 30
  - name: redis
    kind: infrastructure
    readiness:
      check: redis
      interval: 2s
      max_attempts: 30
  - name: rabbitmq
    kind: infrastructure
    readiness:
      check: amqp
      interval: 2s
      max_attempts: 30
  - name: api-gateway
    kind: application
    depends_on: [postgres, redis, rabbitmq]
    readiness:
      check: http
      url: http://localhost:8000/health
      interval: 2s
      max_attempts: 15
topology:
  exchanges:
    - name: billing.events
      type: topic
      durable: true
  queues:
    - name: alerts
      durable: true
      quorum: true
    - name: invoices
      durable: true
  bindings:
    - exchange: billing.events
      queue: alerts
      routing_key: billing.alert.*
    - exchange: billing.events
      queue: invoices
      routing_key: billing.invoice.*
seeds:
  - label: plan_basic
    entity: billing_plans
    natural_key: { column: code, value: basic }
    columns: { price_per_month: "29.00", currency: USD }
  - label: plan_pro
    entity: billing_plans
    natural_key: { column: code, value: pro }
    columns: { price_per_month: "99.00", currency: USD }
  - label: sub_tenant_001
    group: tenant_001_billing
    entity: subscriptions
    natural_key: { column: external_id, value: tenant_001 }
    columns: { status: active }
    refs: { billing_plan_id: plan_pro }
  - label: cycle_tenant_001
    group: tenant_001_billing
    entity: billing_cycles
    natural_key: { column: external_id, value: tenant_001_cycle_1 }
    columns: { status: open }
    refs: { subscription_id: sub_tenant_001 }
  - label: sub_tenant_002
    group: tenant_002_billing
    entity: subscriptions
    natural_key: { column: external_id, value: tenant_002 }
    columns: { status: active }
    refs: { billing_plan_id: plan_basic }
  - label: cycle_tenant_002
    group: tenant_002_billing
    entity: billing_cycles
    natural_key: { column: external_id, value: tenant_002_cycle_1 }
    columns: { status: open }
    refs: { subscription_id: sub_tenant_002 }
artifacts:
  - target: .env
    key_prefix: AQUILA_
    template:
      - AQUILA_BILLING_CURRENCY=USD
      - AQUILA_BUDGET_WARNING_THRESHOLD=0.8
      - AQUILA_BUDGET_CRITICAL_THRESHOLD=0.95
      - AQUILA_PLAN_BASIC_PRICE=29.00
      - AQUILA_PLAN_PRO_PRICE=99.00
tasks:
  test:
    service: api-gateway
    command: pytest
  lint:
    command: ruff check .
"#;

pub fn platform_plan() -> BootstrapPlan {
    BootstrapPlan::from_reader(PLATFORM_PLAN_YAML.as_bytes()).expect("platform plan loads")
}
