// XEP-0077: In-Band Registration, capability descriptors
// https://xmpp.org/extensions/xep-0077.html
//
// Stream features and registration forms are parsed into typed descriptors;
// `plan_submission` is the single place that maps a descriptor to a payload shape.

use std::fmt;
use xmpp_parsers::Element;

use crate::error::{EngineError, EngineResult};
use crate::xmpp::ns;
use crate::xmpp::stanza;

/// What the server advertised in `<stream:features/>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub register: bool,
    pub starttls: bool,
    pub mechanisms: Vec<String>,
}

impl StreamFeatures {
    pub fn from_element(features: &Element) -> Self {
        let mut parsed = StreamFeatures::default();
        for child in features.children() {
            if child.is("register", ns::FEATURE_REGISTER) || child.ns() == ns::REGISTER {
                parsed.register = true;
            } else if child.is("starttls", ns::TLS) {
                parsed.starttls = true;
            } else if child.is("mechanisms", ns::SASL) {
                parsed.mechanisms = child
                    .children()
                    .filter(|m| m.name() == "mechanism")
                    .map(|m| m.text().trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect();
            }
        }
        parsed
    }

    pub fn supports_registration(&self) -> bool {
        self.register
    }
}

/// Field list of a `jabber:x:data` form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFormFields {
    pub form_type: Option<String>,
    pub vars: Vec<String>,
}

impl DataFormFields {
    fn from_element(form: &Element) -> Self {
        let mut fields = DataFormFields::default();
        for field in form.children().filter(|c| c.is("field", ns::DATA_FORMS)) {
            let Some(var) = field.attr("var") else {
                continue;
            };
            if var == "FORM_TYPE" {
                fields.form_type = field
                    .children()
                    .find(|v| v.name() == "value")
                    .map(|v| v.text());
            } else {
                fields.vars.push(var.to_string());
            }
        }
        fields
    }

    pub fn has(&self, var: &str) -> bool {
        self.vars.iter().any(|v| v == var)
    }
}

/// Registration form returned for `<query xmlns='jabber:iq:register'/>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationForm {
    pub data_form: Option<DataFormFields>,
    /// Names of the plain XEP-0077 child fields, e.g. username, password, email
    pub plain_fields: Vec<String>,
    /// The stream is already associated with a registered account
    pub registered: bool,
    pub instructions: Option<String>,
}

impl RegistrationForm {
    pub fn from_query(query: &Element) -> Self {
        let mut form = RegistrationForm::default();
        for child in query.children() {
            if child.is("x", ns::DATA_FORMS) {
                form.data_form = Some(DataFormFields::from_element(child));
            } else if child.ns() == ns::REGISTER {
                match child.name() {
                    "registered" => form.registered = true,
                    "instructions" => {
                        let text = child.text();
                        if !text.trim().is_empty() {
                            form.instructions = Some(text.trim().to_string());
                        }
                    }
                    name => form.plain_fields.push(name.to_string()),
                }
            }
        }
        form
    }

    pub fn offers_data_form(&self) -> bool {
        self.data_form
            .as_ref()
            .map(|fields| fields.has("username") && fields.has("password"))
            .unwrap_or(false)
    }

    pub fn offers_plain_fields(&self) -> bool {
        let has = |name: &str| self.plain_fields.iter().any(|f| f == name);
        has("username") && has("password")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    DataForm,
    Plain,
}

impl PayloadShape {
    pub fn other(self) -> Self {
        match self {
            PayloadShape::DataForm => PayloadShape::Plain,
            PayloadShape::Plain => PayloadShape::DataForm,
        }
    }

    /// Registration query carrying the credentials in this shape
    pub fn build_query(self, username: &str, password: &str) -> Element {
        match self {
            PayloadShape::Plain => Element::builder("query", ns::REGISTER)
                .append(stanza::text_element("username", ns::REGISTER, username))
                .append(stanza::text_element("password", ns::REGISTER, password))
                .build(),
            PayloadShape::DataForm => {
                let form = Element::builder("x", ns::DATA_FORMS)
                    .attr("type", "submit")
                    .append(form_field("FORM_TYPE", Some("hidden"), ns::REGISTER))
                    .append(form_field("username", None, username))
                    .append(form_field("password", None, password))
                    .build();
                Element::builder("query", ns::REGISTER).append(form).build()
            }
        }
    }
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadShape::DataForm => f.write_str("data form"),
            PayloadShape::Plain => f.write_str("plain fields"),
        }
    }
}

fn form_field(var: &str, kind: Option<&str>, value: &str) -> Element {
    let mut field = Element::builder("field", ns::DATA_FORMS).attr("var", var);
    if let Some(kind) = kind {
        field = field.attr("type", kind);
    }
    field
        .append(stanza::text_element("value", ns::DATA_FORMS, value))
        .build()
}

/// First shape to submit and the one to retry with once on a generic error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPlan {
    pub first: PayloadShape,
    pub fallback: PayloadShape,
}

/// | form offers                      | first    | fallback |
/// |----------------------------------|----------|----------|
/// | data form with username/password | DataForm | Plain    |
/// | plain username/password only     | Plain    | DataForm |
/// | both                             | DataForm | Plain    |
/// | neither                          | capability error    |
pub fn plan_submission(form: &RegistrationForm) -> EngineResult<SubmissionPlan> {
    let first = match (form.offers_data_form(), form.offers_plain_fields()) {
        (true, _) => PayloadShape::DataForm,
        (false, true) => PayloadShape::Plain,
        (false, false) => {
            return Err(EngineError::Capability(
                "registration form offers neither a data form nor username/password fields".to_string(),
            ))
        }
    };
    Ok(SubmissionPlan {
        first,
        fallback: first.other(),
    })
}
