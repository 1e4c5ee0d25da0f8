mod enrollment_rules;
mod workflow_validation;
