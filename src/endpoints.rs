use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::canonical::{js_template, to_compact_sorted};
use crate::types::{EndpointCategory, Params, RiskLevel};

pub type DescribeFn = fn(&Params) -> String;

pub const UNKNOWN_ENDPOINT_RISK: RiskLevel = RiskLevel::High;

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub path: &'static str,
    pub method: &'static str,
    pub category: EndpointCategory,
    pub risk_level: RiskLevel,
    pub description: &'static str,
    pub parameters: &'static [ParameterSpec],
    #[serde(skip)]
    describe: DescribeFn,
}

impl std::fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("category", &self.category)
            .field("risk_level", &self.risk_level)
            .finish_non_exhaustive()
    }
}

impl EndpointDescriptor {
    pub const fn new(
        path: &'static str,
        method: &'static str,
        category: EndpointCategory,
        risk_level: RiskLevel,
        description: &'static str,
        parameters: &'static [ParameterSpec],
        describe: DescribeFn,
    ) -> Self {
        Self {
            path,
            method,
            category,
            risk_level,
            description,
            parameters,
            describe,
        }
    }

    /// One-line natural language summary of what `params` would do here.
    pub fn describe(&self, params: &Params) -> String {
        (self.describe)(params)
    }

    pub fn is_sensitive(&self) -> bool {
        self.category == EndpointCategory::Sensitive
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    by_path: BTreeMap<&'static str, EndpointDescriptor>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: EndpointDescriptor) {
        self.by_path.insert(descriptor.path, descriptor);
    }

    pub fn with_default_catalog() -> Self {
        let mut r = Self::new();
        for d in default_catalog() {
            r.register(d);
        }
        r
    }

    pub fn lookup(&self, path: &str) -> Option<&EndpointDescriptor> {
        self.by_path.get(path)
    }

    pub fn describe(&self, path: &str, params: &Params) -> String {
        match self.lookup(path) {
            Some(d) => d.describe(params),
            None => format!("Perform sensitive action: {path}"),
        }
    }

    pub fn risk_level(&self, path: &str) -> RiskLevel {
        self.lookup(path)
            .map(|d| d.risk_level)
            .unwrap_or(UNKNOWN_ENDPOINT_RISK)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.by_path.values()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a Value> {
    params.get(name)
}

fn t(params: &Params, name: &str) -> String {
    js_template(param(params, name))
}

fn describe_system_status(_: &Params) -> String {
    "Retrieve system status".to_string()
}

fn describe_bulk_export(p: &Params) -> String {
    format!(
        "Export data: \"{}\" to destination \"{}\"",
        t(p, "query"),
        t(p, "destination")
    )
}

fn describe_external_communication(p: &Params) -> String {
    format!(
        "Send external message to \"{}\": \"{}\"",
        t(p, "recipient"),
        t(p, "subject")
    )
}

fn describe_modify_permissions(p: &Params) -> String {
    let verb = match param(p, "action") {
        Some(Value::String(a)) if a == "grant" => "Grant",
        _ => "Revoke",
    };
    let permissions = match param(p, "permissions") {
        Some(v) => to_compact_sorted(v).unwrap_or_else(|_| "undefined".to_string()),
        None => "undefined".to_string(),
    };
    format!(
        "{verb} permissions {permissions} for user \"{}\"",
        t(p, "userId")
    )
}

fn describe_financial_transaction(p: &Params) -> String {
    format!(
        "Process {} of ${} to \"{}\"",
        t(p, "type"),
        t(p, "amount"),
        t(p, "recipient")
    )
}

fn describe_deploy_code(p: &Params) -> String {
    format!(
        "Deploy code from \"{}:{}\" to \"{}\"",
        t(p, "repository"),
        t(p, "branch"),
        t(p, "environment")
    )
}

const BULK_EXPORT_PARAMS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "query",
        kind: "string",
        required: true,
        description: "SQL query or data filter to export",
    },
    ParameterSpec {
        name: "destination",
        kind: "string",
        required: true,
        description: "Email or file destination for export",
    },
    ParameterSpec {
        name: "format",
        kind: "string",
        required: false,
        description: "Export format (CSV, JSON, XLSX)",
    },
];

const EXTERNAL_COMMUNICATION_PARAMS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "recipient",
        kind: "string",
        required: true,
        description: "External email recipient",
    },
    ParameterSpec {
        name: "subject",
        kind: "string",
        required: true,
        description: "Message subject",
    },
    ParameterSpec {
        name: "message",
        kind: "string",
        required: true,
        description: "Message body",
    },
    ParameterSpec {
        name: "attachments",
        kind: "string[]",
        required: false,
        description: "File attachments to include",
    },
];

const MODIFY_PERMISSIONS_PARAMS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "userId",
        kind: "string",
        required: true,
        description: "Target user identifier",
    },
    ParameterSpec {
        name: "permissions",
        kind: "string[]",
        required: true,
        description: "Permissions to grant or revoke",
    },
    ParameterSpec {
        name: "action",
        kind: "string",
        required: true,
        description: "grant or revoke",
    },
];

const FINANCIAL_TRANSACTION_PARAMS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "amount",
        kind: "number",
        required: true,
        description: "Transaction amount in USD",
    },
    ParameterSpec {
        name: "recipient",
        kind: "string",
        required: true,
        description: "Payment recipient identifier",
    },
    ParameterSpec {
        name: "type",
        kind: "string",
        required: true,
        description: "payment, refund, transfer or bonus",
    },
    ParameterSpec {
        name: "reference",
        kind: "string",
        required: false,
        description: "Transaction reference or invoice number",
    },
];

const DEPLOY_CODE_PARAMS: &[ParameterSpec] = &[
    ParameterSpec {
        name: "environment",
        kind: "string",
        required: true,
        description: "development, staging or production",
    },
    ParameterSpec {
        name: "repository",
        kind: "string",
        required: true,
        description: "Source code repository",
    },
    ParameterSpec {
        name: "branch",
        kind: "string",
        required: true,
        description: "Git branch to deploy",
    },
];

pub const SYSTEM_STATUS: &str = "/api/regular/system-status";
pub const BULK_EXPORT: &str = "/api/sensitive/bulk-export";
pub const EXTERNAL_COMMUNICATION: &str = "/api/sensitive/external-communication";
pub const MODIFY_PERMISSIONS: &str = "/api/sensitive/modify-permissions";
pub const FINANCIAL_TRANSACTION: &str = "/api/sensitive/financial-transaction";
pub const DEPLOY_CODE: &str = "/api/sensitive/deploy-code";

pub fn default_catalog() -> Vec<EndpointDescriptor> {
    use EndpointCategory::{Regular, Sensitive};

    vec![
        EndpointDescriptor::new(
            SYSTEM_STATUS,
            "GET",
            Regular,
            RiskLevel::Low,
            "Retrieve current system health and status information",
            &[],
            describe_system_status,
        ),
        EndpointDescriptor::new(
            BULK_EXPORT,
            "POST",
            Sensitive,
            RiskLevel::High,
            "Export large datasets with unlimited record limits",
            BULK_EXPORT_PARAMS,
            describe_bulk_export,
        ),
        EndpointDescriptor::new(
            EXTERNAL_COMMUNICATION,
            "POST",
            Sensitive,
            RiskLevel::High,
            "Send messages or data to external recipients",
            EXTERNAL_COMMUNICATION_PARAMS,
            describe_external_communication,
        ),
        EndpointDescriptor::new(
            MODIFY_PERMISSIONS,
            "POST",
            Sensitive,
            RiskLevel::Critical,
            "Grant or revoke user permissions and access levels",
            MODIFY_PERMISSIONS_PARAMS,
            describe_modify_permissions,
        ),
        EndpointDescriptor::new(
            FINANCIAL_TRANSACTION,
            "POST",
            Sensitive,
            RiskLevel::Critical,
            "Process financial transactions and payments",
            FINANCIAL_TRANSACTION_PARAMS,
            describe_financial_transaction,
        ),
        EndpointDescriptor::new(
            DEPLOY_CODE,
            "POST",
            Sensitive,
            RiskLevel::Critical,
            "Deploy code to production or staging environments",
            DEPLOY_CODE_PARAMS,
            describe_deploy_code,
        ),
    ]
}
