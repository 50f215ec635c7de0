use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

/// Field name used by the generic schema served for unregistered resource types.
pub const GENERIC_RESOURCE_FIELD: &str = "resource";

const DATE_PATTERN: &str = r"\d{4}(-(0[1-9]|1[0-2])(-(0[1-9]|[12]\d|3[01]))?)?";
const DATE_TIME_PATTERN: &str = r"\d{4}(-(0[1-9]|1[0-2])(-(0[1-9]|[12]\d|3[01])(T([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]((0\d|1[0-3]):[0-5]\d|14:00)))?)?)?";

/// Expected JSON shape of a field. Selects the coercion path in the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Structural checks applied to a coerced value. `None` means unconstrained.
///
/// `required` is not serialized: elicitations carry it at the top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_bound"
    )]
    pub minimum: Option<f64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_bound"
    )]
    pub maximum: Option<f64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_bound"
    )]
    pub multiple_of: Option<f64>,
    #[serde(skip)]
    pub required: bool,
}

/// Integral bounds go out as JSON integers so clients see `1`, not `1.0`.
fn serialize_bound<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(bound) if bound.fract() == 0.0 && bound.abs() < 9_007_199_254_740_992.0 => {
            serializer.serialize_i64(*bound as i64)
        }
        Some(bound) => serializer.serialize_f64(*bound),
        None => serializer.serialize_none(),
    }
}

/// One field of a resource schema. Built once with the registry, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub shape: Shape,
    pub constraints: ConstraintSet,
    pub description: String,
    pub examples: Vec<String>,
}

impl FieldSpec {
    pub fn new(name: &str, shape: Shape, description: &str) -> Self {
        Self {
            name: name.to_string(),
            shape,
            constraints: ConstraintSet::default(),
            description: description.to_string(),
            examples: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.constraints.required = true;
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.constraints.allowed = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.constraints.pattern = Some(pattern.to_string());
        self
    }

    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_length = min;
        self.constraints.max_length = max;
        self
    }

    pub fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.constraints.minimum = minimum;
        self.constraints.maximum = maximum;
        self
    }

    pub fn multiple_of(mut self, step: f64) -> Self {
        self.constraints.multiple_of = Some(step);
        self
    }

    pub fn examples(mut self, examples: &[&str]) -> Self {
        self.examples = examples.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn is_required(&self) -> bool {
        self.constraints.required
    }
}

#[derive(Debug, Clone, Default)]
struct ResourceSchema {
    fields: Vec<FieldSpec>,
    search: Vec<FieldSpec>,
}

/// Maps FHIR resource types to their ordered field specs.
///
/// Lookups are exact-match. Unknown types get a generic schema instead of an
/// error so the dialogue always has something to ask for.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, ResourceSchema>,
    default_fields: Vec<FieldSpec>,
    default_search: Vec<FieldSpec>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::fhir_r4()
    }
}

impl SchemaRegistry {
    /// Registry with only the generic fallback schema.
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
            default_fields: vec![
                FieldSpec::new(
                    GENERIC_RESOURCE_FIELD,
                    Shape::Object,
                    "Complete FHIR resource as a JSON object",
                )
                .required()
                .examples(&[r#"{"status":"active"}"#]),
            ],
            default_search: vec![
                FieldSpec::new("_id", Shape::String, "Logical id of the resource")
                    .pattern(r"[A-Za-z0-9\-.]{1,64}")
                    .examples(&["example"]),
            ],
        }
    }

    pub fn register(
        &mut self,
        resource_type: &str,
        fields: Vec<FieldSpec>,
        search: Vec<FieldSpec>,
    ) -> &mut Self {
        self.schemas
            .insert(resource_type.to_string(), ResourceSchema { fields, search });
        self
    }

    pub fn is_registered(&self, resource_type: &str) -> bool {
        self.schemas.contains_key(resource_type)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Ordered field specs for `resource_type`, or the generic default set.
    pub fn fields_for(&self, resource_type: &str) -> &[FieldSpec] {
        self.schemas
            .get(resource_type)
            .map(|schema| schema.fields.as_slice())
            .unwrap_or(&self.default_fields)
    }

    /// Ordered search criteria for `resource_type`, or the generic `_id` criterion.
    pub fn search_fields_for(&self, resource_type: &str) -> &[FieldSpec] {
        self.schemas
            .get(resource_type)
            .map(|schema| schema.search.as_slice())
            .filter(|search| !search.is_empty())
            .unwrap_or(&self.default_search)
    }

    pub fn field(&self, resource_type: &str, name: &str) -> Option<&FieldSpec> {
        self.fields_for(resource_type)
            .iter()
            .find(|spec| spec.name == name)
    }

    pub fn search_field(&self, resource_type: &str, name: &str) -> Option<&FieldSpec> {
        self.search_fields_for(resource_type)
            .iter()
            .find(|spec| spec.name == name)
    }

    /// Built-in FHIR R4 schemas. Declaration order is elicitation order.
    pub fn fhir_r4() -> Self {
        let mut registry = Self::empty();

        registry.register(
            "Patient",
            vec![
                FieldSpec::new("name", Shape::Array, "Patient name(s) as FHIR HumanName entries")
                    .required()
                    .examples(&[
                        r#"[{"family":"Smith","given":["John"]}]"#,
                        r#"[{"use":"official","family":"Chalmers","given":["Peter","James"]}]"#,
                    ]),
                FieldSpec::new("gender", Shape::String, "Administrative gender")
                    .required()
                    .one_of(&["male", "female", "other", "unknown"])
                    .examples(&["female", "male"]),
                FieldSpec::new("birthDate", Shape::String, "Date of birth (YYYY, YYYY-MM or YYYY-MM-DD)")
                    .required()
                    .pattern(DATE_PATTERN)
                    .examples(&["1980-04-12", "1974-12"]),
                FieldSpec::new("telecom", Shape::Array, "Contact points such as phone or email")
                    .examples(&[r#"[{"system":"phone","value":"555-0100","use":"home"}]"#]),
                FieldSpec::new("address", Shape::Array, "Postal addresses")
                    .examples(&[r#"[{"line":["534 Erewhon St"],"city":"PleasantVille","postalCode":"3999"}]"#]),
                FieldSpec::new("multipleBirthInteger", Shape::Number, "Birth order for multiple births")
                    .range(Some(1.0), Some(10.0))
                    .multiple_of(1.0)
                    .examples(&["2"]),
                FieldSpec::new("active", Shape::Boolean, "Whether the record is in active use")
                    .examples(&["true"]),
            ],
            vec![
                FieldSpec::new("family", Shape::String, "Family (last) name")
                    .length(Some(1), Some(100))
                    .examples(&["Smith"]),
                FieldSpec::new("given", Shape::String, "Given (first) name")
                    .length(Some(1), Some(100))
                    .examples(&["John"]),
                FieldSpec::new("birthdate", Shape::String, "Date of birth (YYYY-MM-DD)")
                    .pattern(DATE_PATTERN)
                    .examples(&["1980-04-12"]),
                FieldSpec::new("identifier", Shape::String, "Identifier as system|value or value")
                    .examples(&["http://hospital.example.org/mrn|12345"]),
            ],
        );

        registry.register(
            "Observation",
            vec![
                FieldSpec::new("status", Shape::String, "Status of the observation result")
                    .required()
                    .one_of(&[
                        "registered",
                        "preliminary",
                        "final",
                        "amended",
                        "corrected",
                        "cancelled",
                        "entered-in-error",
                        "unknown",
                    ])
                    .examples(&["final", "preliminary"]),
                FieldSpec::new("code", Shape::Object, "What was observed, as a CodeableConcept")
                    .required()
                    .examples(&[
                        r#"{"coding":[{"system":"http://loinc.org","code":"8867-4","display":"Heart rate"}]}"#,
                    ]),
                FieldSpec::new("subject", Shape::Object, "Reference to the patient observed")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("effectiveDateTime", Shape::String, "Clinically relevant time")
                    .pattern(DATE_TIME_PATTERN)
                    .examples(&["2024-03-01T09:30:00Z"]),
                FieldSpec::new("valueQuantity", Shape::Object, "Measured value as a Quantity")
                    .examples(&[
                        r#"{"value":72,"unit":"beats/minute","system":"http://unitsofmeasure.org","code":"/min"}"#,
                    ]),
            ],
            clinical_search_fields("8867-4"),
        );

        registry.register(
            "Encounter",
            vec![
                FieldSpec::new("status", Shape::String, "Current state of the encounter")
                    .required()
                    .one_of(&[
                        "planned",
                        "arrived",
                        "triaged",
                        "in-progress",
                        "onleave",
                        "finished",
                        "cancelled",
                        "entered-in-error",
                        "unknown",
                    ])
                    .examples(&["finished", "in-progress"]),
                FieldSpec::new("class", Shape::Object, "Classification of the encounter as a Coding")
                    .required()
                    .examples(&[
                        r#"{"system":"http://terminology.hl7.org/CodeSystem/v3-ActCode","code":"AMB","display":"ambulatory"}"#,
                    ]),
                FieldSpec::new("subject", Shape::Object, "Reference to the patient")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("period", Shape::Object, "Start and end of the encounter")
                    .examples(&[r#"{"start":"2024-03-01T09:00:00Z","end":"2024-03-01T09:45:00Z"}"#]),
            ],
            vec![
                FieldSpec::new("patient", Shape::String, "Patient reference or id")
                    .examples(&["Patient/example"]),
                FieldSpec::new("status", Shape::String, "Encounter status")
                    .examples(&["finished"]),
            ],
        );

        registry.register(
            "Condition",
            vec![
                FieldSpec::new("code", Shape::Object, "Identification of the condition as a CodeableConcept")
                    .required()
                    .examples(&[
                        r#"{"coding":[{"system":"http://snomed.info/sct","code":"44054006","display":"Diabetes mellitus type 2"}]}"#,
                    ]),
                FieldSpec::new("subject", Shape::Object, "Reference to the patient")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("clinicalStatus", Shape::Object, "Clinical status as a CodeableConcept")
                    .examples(&[
                        r#"{"coding":[{"system":"http://terminology.hl7.org/CodeSystem/condition-clinical","code":"active"}]}"#,
                    ]),
                FieldSpec::new("onsetDateTime", Shape::String, "Estimated or actual onset")
                    .pattern(DATE_TIME_PATTERN)
                    .examples(&["2019-06-15"]),
            ],
            clinical_search_fields("44054006"),
        );

        registry.register(
            "MedicationRequest",
            vec![
                FieldSpec::new("status", Shape::String, "Status of the prescription")
                    .required()
                    .one_of(&[
                        "active",
                        "on-hold",
                        "cancelled",
                        "completed",
                        "entered-in-error",
                        "stopped",
                        "draft",
                        "unknown",
                    ])
                    .examples(&["active", "draft"]),
                FieldSpec::new("intent", Shape::String, "Whether this is a proposal, plan or order")
                    .required()
                    .one_of(&[
                        "proposal",
                        "plan",
                        "order",
                        "original-order",
                        "reflex-order",
                        "filler-order",
                        "instance-order",
                        "option",
                    ])
                    .examples(&["order"]),
                FieldSpec::new(
                    "medicationCodeableConcept",
                    Shape::Object,
                    "Medication to be taken, as a CodeableConcept",
                )
                .required()
                .examples(&[
                    r#"{"coding":[{"system":"http://www.nlm.nih.gov/research/umls/rxnorm","code":"197361","display":"Amlodipine 5 MG Oral Tablet"}]}"#,
                ]),
                FieldSpec::new("subject", Shape::Object, "Reference to the patient")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("dosageInstruction", Shape::Array, "How the medication should be taken")
                    .examples(&[r#"[{"text":"One tablet daily"}]"#]),
            ],
            clinical_search_fields("197361"),
        );

        registry.register(
            "AllergyIntolerance",
            vec![
                FieldSpec::new("patient", Shape::Object, "Reference to the patient")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("code", Shape::Object, "Substance or class, as a CodeableConcept")
                    .examples(&[
                        r#"{"coding":[{"system":"http://snomed.info/sct","code":"227493005","display":"Cashew nuts"}]}"#,
                    ]),
                FieldSpec::new("criticality", Shape::String, "Estimated potential clinical harm")
                    .one_of(&["low", "high", "unable-to-assess"])
                    .examples(&["high"]),
            ],
            clinical_search_fields("227493005"),
        );

        registry.register(
            "Immunization",
            vec![
                FieldSpec::new("status", Shape::String, "Status of the immunization event")
                    .required()
                    .one_of(&["completed", "entered-in-error", "not-done"])
                    .examples(&["completed"]),
                FieldSpec::new("vaccineCode", Shape::Object, "Vaccine administered, as a CodeableConcept")
                    .required()
                    .examples(&[
                        r#"{"coding":[{"system":"http://hl7.org/fhir/sid/cvx","code":"140","display":"Influenza, seasonal, injectable"}]}"#,
                    ]),
                FieldSpec::new("patient", Shape::Object, "Reference to the patient")
                    .required()
                    .examples(&[r#"{"reference":"Patient/example"}"#]),
                FieldSpec::new("occurrenceDateTime", Shape::String, "When the vaccine was administered")
                    .required()
                    .pattern(DATE_TIME_PATTERN)
                    .examples(&["2024-10-01", "2024-10-01T10:15:00Z"]),
            ],
            clinical_search_fields("140"),
        );

        registry.register(
            "Practitioner",
            vec![
                FieldSpec::new("name", Shape::Array, "Practitioner name(s) as FHIR HumanName entries")
                    .required()
                    .examples(&[r#"[{"family":"Careful","given":["Adam"],"prefix":["Dr"]}]"#]),
                FieldSpec::new("active", Shape::Boolean, "Whether the record is in active use")
                    .examples(&["true"]),
                FieldSpec::new("telecom", Shape::Array, "Contact points such as phone or email")
                    .examples(&[r#"[{"system":"email","value":"adam.careful@example.org"}]"#]),
            ],
            vec![
                FieldSpec::new("family", Shape::String, "Family (last) name")
                    .length(Some(1), Some(100))
                    .examples(&["Careful"]),
                FieldSpec::new("identifier", Shape::String, "Identifier as system|value or value")
                    .examples(&["http://hl7.org/fhir/sid/us-npi|1234567893"]),
            ],
        );

        registry.register(
            "Organization",
            vec![
                FieldSpec::new("name", Shape::String, "Name used for the organization")
                    .required()
                    .length(Some(1), Some(200))
                    .examples(&["Burgers University Medical Center"]),
                FieldSpec::new("active", Shape::Boolean, "Whether the record is in active use")
                    .examples(&["true"]),
            ],
            vec![
                FieldSpec::new("name", Shape::String, "Organization name or prefix")
                    .length(Some(1), Some(200))
                    .examples(&["Burgers"]),
            ],
        );

        registry
    }
}

fn clinical_search_fields(example_code: &str) -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("patient", Shape::String, "Patient reference or id")
            .examples(&["Patient/example"]),
        FieldSpec::new("code", Shape::String, "Code as system|code or code")
            .examples(&[example_code]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_type_falls_back_to_generic_resource_field() {
        let registry = SchemaRegistry::fhir_r4();
        let fields = registry.fields_for("Basic");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, GENERIC_RESOURCE_FIELD);
        assert!(fields[0].is_required());
        assert!(!registry.is_registered("Basic"));
    }

    #[test]
    fn lookup_is_exact_match() {
        let registry = SchemaRegistry::fhir_r4();
        assert!(registry.is_registered("Patient"));
        assert!(!registry.is_registered("patient"));
        assert_eq!(registry.fields_for("patient")[0].name, GENERIC_RESOURCE_FIELD);
    }

    #[test]
    fn patient_schema_starts_with_name_array() {
        let registry = SchemaRegistry::fhir_r4();
        let first = &registry.fields_for("Patient")[0];
        assert_eq!(first.name, "name");
        assert_eq!(first.shape, Shape::Array);
    }

    #[test]
    fn every_registered_field_has_an_example() {
        let registry = SchemaRegistry::fhir_r4();
        for resource_type in registry.resource_types() {
            for spec in registry
                .fields_for(resource_type)
                .iter()
                .chain(registry.search_fields_for(resource_type))
            {
                assert!(
                    !spec.examples.is_empty(),
                    "{resource_type}.{} has no example",
                    spec.name
                );
            }
        }
    }

    #[test]
    fn constraint_set_serializes_integral_bounds_as_integers() {
        let spec = FieldSpec::new("selection", Shape::Number, "pick one")
            .required()
            .range(Some(1.0), Some(3.0));
        let value = serde_json::to_value(&spec.constraints).unwrap();
        assert_eq!(value, json!({ "minimum": 1, "maximum": 3 }));
    }

    #[test]
    fn constraint_set_serializes_enum_and_lengths_in_camel_case() {
        let spec = FieldSpec::new("status", Shape::String, "status")
            .one_of(&["final"])
            .length(Some(1), Some(5));
        let value = serde_json::to_value(&spec.constraints).unwrap();
        assert_eq!(value["enum"], json!(["final"]));
        assert_eq!(value["minLength"], 1);
        assert_eq!(value["maxLength"], 5);
        assert!(value.get("required").is_none());
    }

    #[test]
    fn search_fields_fall_back_to_logical_id() {
        let registry = SchemaRegistry::fhir_r4();
        assert_eq!(registry.search_fields_for("Basic")[0].name, "_id");
        assert_eq!(registry.search_fields_for("Patient")[0].name, "family");
    }
}
