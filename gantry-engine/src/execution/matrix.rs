// Matrix Strategy Expansion
// Expands a job template's matrix into concrete job instances

use crate::parser::error::ConfigError;
use crate::pipeline::models::{JobTemplate, MatrixAxis, MatrixSpec, SidecarSpec, StepDefinition};

use std::collections::BTreeMap;
use std::sync::Arc;

/// One axis assignment per entry, in axis declaration order
pub type Selection = Vec<(String, String)>;

/// A job template bound to one matrix selection
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// `job` without a matrix, `job (axis=value, ...)` otherwise
    pub id: String,
    pub template: Arc<JobTemplate>,
    pub selection: Selection,
    /// Job env plus `MATRIX_<AXIS>` variables
    pub env: BTreeMap<String, String>,
    /// Steps with matrix references substituted
    pub steps: Vec<StepDefinition>,
}

impl JobInstance {
    pub fn job_id(&self) -> &str {
        &self.template.id
    }

    pub fn sidecars(&self) -> &[SidecarSpec] {
        &self.template.sidecars
    }
}

/// Lazy, restartable iterator over the cartesian product of matrix axes.
///
/// The first axis varies slowest; within an axis values are visited in
/// lexicographic order regardless of how they were declared.
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    axes: &'a [MatrixAxis],
    /// Per axis, value positions sorted by value
    order: Vec<Vec<usize>>,
    indices: Vec<usize>,
    done: bool,
}

impl<'a> Combinations<'a> {
    pub fn new(axes: &'a [MatrixAxis]) -> Self {
        let order = axes
            .iter()
            .map(|axis| {
                let mut positions: Vec<usize> = (0..axis.values.len()).collect();
                positions.sort_by(|&a, &b| axis.values[a].cmp(&axis.values[b]));
                positions
            })
            .collect();

        Self {
            axes,
            order,
            indices: vec![0; axes.len()],
            done: axes.is_empty() || axes.iter().any(|axis| axis.values.is_empty()),
        }
    }

    /// Start again from the first combination
    pub fn reset(&mut self) {
        self.indices.iter_mut().for_each(|index| *index = 0);
        self.done = self.axes.is_empty() || self.axes.iter().any(|axis| axis.values.is_empty());
    }

    fn advance(&mut self) {
        for position in (0..self.indices.len()).rev() {
            self.indices[position] += 1;
            if self.indices[position] < self.axes[position].values.len() {
                return;
            }
            self.indices[position] = 0;
        }
        self.done = true;
    }
}

impl Iterator for Combinations<'_> {
    type Item = Selection;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let current = self
            .axes
            .iter()
            .zip(&self.order)
            .zip(&self.indices)
            .map(|((axis, order), &index)| (axis.name.clone(), axis.values[order[index]].clone()))
            .collect();

        self.advance();
        Some(current)
    }
}

/// Matrix expander for job templates
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into its instances, in deterministic matrix order
    pub fn expand(template: &Arc<JobTemplate>) -> Result<Vec<JobInstance>, ConfigError> {
        Self::selections(template)?
            .into_iter()
            .map(|selection| {
                let (env, steps) = Self::render(template, &selection)?;
                Ok(JobInstance {
                    id: instance_id(&template.id, &selection),
                    template: Arc::clone(template),
                    selection,
                    env,
                    steps,
                })
            })
            .collect()
    }

    /// Check that a template expands cleanly, without keeping the instances
    pub fn validate(template: &JobTemplate) -> Result<(), ConfigError> {
        for selection in Self::selections(template)? {
            Self::render(template, &selection)?;
        }
        Ok(())
    }

    /// All selections of a template: product minus excludes, then includes
    pub fn selections(template: &JobTemplate) -> Result<Vec<Selection>, ConfigError> {
        let Some(matrix) = &template.matrix else {
            return Ok(vec![Vec::new()]);
        };

        let path = format!("jobs.{}.strategy.matrix", template.id);
        Self::validate_matrix(matrix).map_err(|e| e.at(path.clone()))?;

        let mut selections: Vec<Selection> = Combinations::new(&matrix.axes)
            .filter(|selection| !matrix.is_excluded(selection))
            .collect();

        for include in &matrix.include {
            let mut selection = include.entries.clone();
            // Present include entries in axis declaration order
            selection.sort_by_key(|(name, _)| {
                matrix
                    .axes
                    .iter()
                    .position(|axis| &axis.name == name)
                    .unwrap_or(usize::MAX)
            });
            if !selections.contains(&selection) {
                selections.push(selection);
            }
        }

        if selections.is_empty() {
            return Err(ConfigError::invalid_matrix(format!(
                "matrix of job '{}' produces no instances",
                template.id
            ))
            .at(path));
        }

        Ok(selections)
    }

    fn validate_matrix(matrix: &MatrixSpec) -> Result<(), ConfigError> {
        for (position, axis) in matrix.axes.iter().enumerate() {
            if axis.values.is_empty() {
                return Err(ConfigError::invalid_matrix(format!(
                    "axis '{}' has no values",
                    axis.name
                )));
            }
            if matrix.axes[..position].iter().any(|a| a.name == axis.name) {
                return Err(ConfigError::invalid_matrix(format!(
                    "axis '{}' is declared twice",
                    axis.name
                )));
            }
        }

        for rule in &matrix.exclude {
            if rule.entries.is_empty() {
                return Err(ConfigError::invalid_matrix("exclude rule is empty"));
            }
            for (name, value) in &rule.entries {
                let axis = matrix.get_axis(name).ok_or_else(|| {
                    ConfigError::invalid_matrix(format!(
                        "exclude rule references undeclared axis '{}'",
                        name
                    ))
                })?;
                if !axis.values.contains(value) {
                    return Err(ConfigError::invalid_matrix(format!(
                        "exclude rule references undeclared value '{}' of axis '{}'",
                        value, name
                    )));
                }
            }
        }

        for include in &matrix.include {
            if include.entries.is_empty() {
                return Err(ConfigError::invalid_matrix("include entry is empty"));
            }
            for (position, (name, _)) in include.entries.iter().enumerate() {
                if matrix.get_axis(name).is_none() {
                    return Err(ConfigError::invalid_matrix(format!(
                        "include entry references undeclared axis '{}'",
                        name
                    )));
                }
                if include.entries[..position].iter().any(|(n, _)| n == name) {
                    return Err(ConfigError::invalid_matrix(format!(
                        "include entry assigns axis '{}' twice",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Instance environment and substituted steps for one selection
    fn render(
        template: &JobTemplate,
        selection: &[(String, String)],
    ) -> Result<(BTreeMap<String, String>, Vec<StepDefinition>), ConfigError> {
        let substitute = |text: &str, path: &dyn Fn() -> String| {
            substitute_matrix(text, selection).map_err(|e| e.at(path()))
        };

        let mut env = BTreeMap::new();
        for (key, value) in &template.env {
            let value = substitute(value, &|| format!("jobs.{}.env.{}", template.id, key))?;
            env.insert(key.clone(), value);
        }
        for (axis, value) in selection {
            env.insert(matrix_env_name(axis), value.clone());
        }

        let mut steps = Vec::with_capacity(template.steps.len());
        for (index, step) in template.steps.iter().enumerate() {
            let path = || format!("jobs.{}.steps[{}]", template.id, index);
            let mut step = step.clone();
            step.name = substitute(&step.name, &path)?;
            step.command = substitute(&step.command, &path)?;
            for value in step.env.values_mut() {
                *value = substitute(value, &path)?;
            }
            if let Some(dir) = &step.working_directory {
                let dir = substitute(&dir.to_string_lossy(), &path)?;
                step.working_directory = Some(dir.into());
            }
            steps.push(step);
        }

        Ok((env, steps))
    }
}

/// Unique instance id: `job` or `job (axis=value, ...)`
pub fn instance_id(job_id: &str, selection: &[(String, String)]) -> String {
    if selection.is_empty() {
        return job_id.to_string();
    }
    let parts: Vec<String> = selection
        .iter()
        .map(|(axis, value)| format!("{}={}", axis, value))
        .collect();
    format!("{} ({})", job_id, parts.join(", "))
}

/// `python-version` -> `MATRIX_PYTHON_VERSION`
pub fn matrix_env_name(axis: &str) -> String {
    format!("MATRIX_{}", env_key(axis))
}

/// Uppercase, with anything outside `[A-Z0-9]` replaced by `_`
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Replace `${{ matrix.<axis> }}` references.
///
/// Other `${{ ... }}` expressions are left untouched; a reference to an axis the
/// selection does not assign is an error.
pub fn substitute_matrix(text: &str, selection: &[(String, String)]) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        let expr = rest[start + 3..start + len].trim();

        output.push_str(&rest[..start]);
        match expr.strip_prefix("matrix.") {
            Some(axis) => {
                let value = selection
                    .iter()
                    .find(|(name, _)| name == axis.trim())
                    .map(|(_, value)| value)
                    .ok_or_else(|| {
                        ConfigError::invalid_matrix(format!(
                            "unknown matrix axis '{}' in '{}'",
                            axis.trim(),
                            text
                        ))
                    })?;
                output.push_str(value);
            }
            None => output.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::error::ConfigErrorKind;

    fn pairs(selection: &Selection) -> Vec<(&str, &str)> {
        selection
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    fn template(matrix: MatrixSpec) -> Arc<JobTemplate> {
        Arc::new(
            JobTemplate::new("test")
                .with_step(StepDefinition::new("run", "echo ${{ matrix.x }}"))
                .with_matrix(matrix),
        )
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let job = Arc::new(JobTemplate::new("lint").with_step(StepDefinition::new("lint", "make lint")));

        let instances = MatrixExpander::expand(&job).unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "lint");
        assert!(instances[0].selection.is_empty());
    }

    #[test]
    fn test_product_minus_exclude() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a", "b"])
                .axis("y", ["1", "2"])
                .exclude([("x", "b"), ("y", "2")]),
        );

        let instances = MatrixExpander::expand(&job).unwrap();
        let selections: Vec<_> = instances.iter().map(|i| pairs(&i.selection)).collect();

        assert_eq!(
            selections,
            vec![
                vec![("x", "a"), ("y", "1")],
                vec![("x", "a"), ("y", "2")],
                vec![("x", "b"), ("y", "1")],
            ]
        );
        assert_eq!(instances[0].id, "test (x=a, y=1)");
    }

    #[test]
    fn test_values_visited_in_lexicographic_order() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["c", "a", "b"])
                .axis("y", ["2", "1"]),
        );

        let first: Vec<String> = MatrixExpander::expand(&job)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        let second: Vec<String> = MatrixExpander::expand(&job)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                "test (x=a, y=1)",
                "test (x=a, y=2)",
                "test (x=b, y=1)",
                "test (x=b, y=2)",
                "test (x=c, y=1)",
                "test (x=c, y=2)",
            ]
        );
    }

    #[test]
    fn test_combinations_reset() {
        let axes = vec![
            MatrixAxis {
                name: "x".into(),
                values: vec!["a".into(), "b".into()],
            },
            MatrixAxis {
                name: "y".into(),
                values: vec!["1".into()],
            },
        ];

        let mut combos = Combinations::new(&axes);
        assert_eq!(combos.by_ref().count(), 2);
        assert_eq!(combos.next(), None);

        combos.reset();
        assert_eq!(
            combos.next(),
            Some(vec![
                ("x".to_string(), "a".to_string()),
                ("y".to_string(), "1".to_string())
            ])
        );
    }

    #[test]
    fn test_exclude_undeclared_axis() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a"])
                .exclude([("z", "a")]),
        );

        let err = MatrixExpander::expand(&job).unwrap_err();
        assert_eq!(err.kind, ConfigErrorKind::InvalidMatrix);
        assert!(err.message.contains("undeclared axis 'z'"));
    }

    #[test]
    fn test_exclude_undeclared_value() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a"])
                .exclude([("x", "q")]),
        );

        let err = MatrixExpander::expand(&job).unwrap_err();
        assert!(err.message.contains("undeclared value 'q'"));
    }

    #[test]
    fn test_empty_axis_rejected() {
        let job = template(MatrixSpec::new().axis("x", Vec::<String>::new()));
        assert!(MatrixExpander::expand(&job).is_err());
    }

    #[test]
    fn test_everything_excluded_rejected() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a"])
                .exclude([("x", "a")]),
        );

        let err = MatrixExpander::expand(&job).unwrap_err();
        assert!(err.message.contains("no instances"));
    }

    #[test]
    fn test_include_appended_after_product() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a"])
                .axis("y", ["1"])
                .include([("y", "9"), ("x", "z")])
                .include([("x", "a"), ("y", "1")]),
        );

        let instances = MatrixExpander::expand(&job).unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].id, "test (x=z, y=9)");
    }

    #[test]
    fn test_include_not_filtered_by_exclude() {
        let job = template(
            MatrixSpec::new()
                .axis("x", ["a", "b"])
                .exclude([("x", "b")])
                .include([("x", "b")]),
        );

        let ids: Vec<String> = MatrixExpander::expand(&job)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();

        assert_eq!(ids, vec!["test (x=a)", "test (x=b)"]);
    }

    #[test]
    fn test_matrix_env_and_substitution() {
        let job = Arc::new(
            JobTemplate::new("test")
                .with_env("PY", "python${{ matrix.python-version }}")
                .with_step(
                    StepDefinition::new("test on ${{matrix.python-version}}", "tox")
                        .with_env("TARGET", "${{ matrix.python-version }}"),
                )
                .with_matrix(MatrixSpec::new().axis("python-version", ["3.9"])),
        );

        let instance = &MatrixExpander::expand(&job).unwrap()[0];

        assert_eq!(instance.env["MATRIX_PYTHON_VERSION"], "3.9");
        assert_eq!(instance.env["PY"], "python3.9");
        assert_eq!(instance.steps[0].name, "test on 3.9");
        assert_eq!(instance.steps[0].env["TARGET"], "3.9");
    }

    #[test]
    fn test_unknown_matrix_reference() {
        let job = template(MatrixSpec::new().axis("y", ["1"]));

        let err = MatrixExpander::validate(&job).unwrap_err();
        assert!(err.message.contains("unknown matrix axis 'x'"));
        assert_eq!(err.path.as_deref(), Some("jobs.test.steps[0]"));
    }

    #[test]
    fn test_other_expressions_untouched() {
        let text = "echo ${{ secrets.TOKEN }} ${{ matrix.x }}";
        let selection = vec![("x".to_string(), "1".to_string())];

        assert_eq!(
            substitute_matrix(text, &selection).unwrap(),
            "echo ${{ secrets.TOKEN }} 1"
        );
    }
}
