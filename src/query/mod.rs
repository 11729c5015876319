use std::{fmt, str::FromStr};

use serde_json::Value;

use crate::{Error, Result, filter::Filter};

/// One sort key: a logical field name and its direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortBy {
    pub field: String,
    pub ascending: bool,
}

impl SortBy {
    pub fn new(field: impl Into<String>, ascending: bool) -> Self {
        Self {
            field: field.into(),
            ascending,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, true)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, false)
    }
}

/// Ordered list of sort keys, most significant first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortSpec(Vec<SortBy>);

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push(SortBy::asc(field));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push(SortBy::desc(field));
        self
    }

    pub fn push(&mut self, key: SortBy) {
        self.0.push(key);
    }

    pub fn keys(&self) -> &[SortBy] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this sort with `identifier` appended ascending as the final tie-break.
    ///
    /// Keys are not deduplicated: a sort that already orders by the identifier ends up
    /// with it twice.
    pub fn with_identifier(&self, identifier: &str) -> SortSpec {
        let mut keys = Vec::with_capacity(self.0.len() + 1);
        keys.extend(self.0.iter().cloned());
        keys.push(SortBy::asc(identifier));
        SortSpec(keys)
    }
}

impl From<Vec<SortBy>> for SortSpec {
    fn from(keys: Vec<SortBy>) -> Self {
        Self(keys)
    }
}

impl FromIterator<SortBy> for SortSpec {
    fn from_iter<I: IntoIterator<Item = SortBy>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses `field[:asc|:desc]` entries separated by commas, e.g. `group:asc,name:desc`.
impl FromStr for SortSpec {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut spec = SortSpec::new();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (field, direction) = match entry.split_once(':') {
                Some((field, direction)) => (field.trim(), direction.trim()),
                None => (entry, "asc"),
            };
            if field.is_empty() {
                return Err(Error::contract(format!("sort entry `{entry}` has no field")));
            }
            let ascending = match direction.to_ascii_lowercase().as_str() {
                "asc" => true,
                "desc" => false,
                other => {
                    return Err(Error::contract(format!(
                        "unknown sort direction `{other}` for `{field}`"
                    )));
                }
            };
            spec.push(SortBy::new(field, ascending));
        }
        Ok(spec)
    }
}

/// A named parameter and the value bound to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub name: String,
    pub value: Value,
}

/// Query text with named `:param` placeholders plus the values bound to them.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedQuery {
    text: String,
    bindings: Vec<Binding>,
}

impl RenderedQuery {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.value)
    }

    /// Rewrite named placeholders into `$1, $2, ...` and return the values in that order.
    ///
    /// `::` casts and single-quoted literals are copied through untouched. A placeholder
    /// used twice maps to the same position.
    pub fn to_positional(&self) -> Result<(String, Vec<Value>)> {
        let mut sql = String::with_capacity(self.text.len());
        let mut order: Vec<&str> = Vec::new();
        let mut values = Vec::new();
        let mut chars = self.text.char_indices().peekable();
        let mut in_literal = false;

        while let Some((idx, ch)) = chars.next() {
            if in_literal {
                sql.push(ch);
                if ch == '\'' {
                    in_literal = false;
                }
                continue;
            }
            match ch {
                '\'' => {
                    in_literal = true;
                    sql.push(ch);
                }
                ':' => match chars.peek().copied() {
                    Some((_, ':')) => {
                        chars.next();
                        sql.push_str("::");
                    }
                    Some((_, next)) if next.is_ascii_alphabetic() || next == '_' => {
                        let start = idx + 1;
                        let mut end = start;
                        while let Some(&(i, c)) = chars.peek() {
                            if c.is_ascii_alphanumeric() || c == '_' {
                                end = i + c.len_utf8();
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        let name = &self.text[start..end];
                        let position = match order.iter().position(|n| *n == name) {
                            Some(pos) => pos + 1,
                            None => {
                                let value =
                                    self.binding(name).cloned().ok_or_else(|| Error::QueryError {
                                        query: self.text.clone(),
                                        context: format!("no value bound for parameter `{name}`"),
                                    })?;
                                order.push(name);
                                values.push(value);
                                order.len()
                            }
                        };
                        sql.push('$');
                        sql.push_str(&position.to_string());
                    }
                    _ => sql.push(ch),
                },
                _ => sql.push(ch),
            }
        }

        Ok((sql, values))
    }
}

impl fmt::Display for RenderedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Text accumulator with the shape of `sqlx::QueryBuilder`, but emitting named placeholders.
#[derive(Debug, Default)]
struct QueryWriter {
    text: String,
    bindings: Vec<Binding>,
}

impl QueryWriter {
    fn new(init: &str) -> Self {
        Self {
            text: init.to_string(),
            bindings: Vec::new(),
        }
    }

    fn push(&mut self, fragment: &str) -> &mut Self {
        self.text.push_str(fragment);
        self
    }

    fn push_bind(&mut self, name: String, value: Value) -> &mut Self {
        self.text.push(':');
        self.text.push_str(&name);
        self.bindings.push(Binding { name, value });
        self
    }

    fn finish(self) -> RenderedQuery {
        RenderedQuery {
            text: self.text,
            bindings: self.bindings,
        }
    }
}

/// Maps a logical field name to the expression the backend understands.
pub type FieldQualifier<'a> = &'a dyn Fn(&str) -> String;

/// Renders `select <expr> from <entity> as <alias> [where ...] [order by ...]`.
#[derive(Clone, Copy, Debug)]
pub struct QueryBuilder<'a> {
    entity_name: &'a str,
    alias: &'a str,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(entity_name: &'a str, alias: &'a str) -> Self {
        Self { entity_name, alias }
    }

    /// Render a query.
    ///
    /// `select` is copied verbatim. Without a `qualifier`, fields are prefixed with the
    /// alias (`obj.name`). Each sort direction is flipped when `reverse` is set, so one
    /// sort serves both forward and backward paging. `Some` empty sort is rejected.
    pub fn build(
        &self,
        select: &str,
        filter: Option<&Filter>,
        sort: Option<&SortSpec>,
        reverse: bool,
        qualifier: Option<FieldQualifier<'_>>,
    ) -> Result<RenderedQuery> {
        if let Some(sort) = sort {
            if sort.is_empty() {
                return Err(Error::contract("sort must be either absent or non-empty"));
            }
        }
        if let Some(filter) = filter {
            filter.validate()?;
        }

        let alias = self.alias;
        let default_qualifier = move |field: &str| format!("{alias}.{field}");
        let qualify: FieldQualifier<'_> = match qualifier {
            Some(q) => q,
            None => &default_qualifier,
        };

        let mut writer = QueryWriter::new("select ");
        writer
            .push(select)
            .push(" from ")
            .push(self.entity_name)
            .push(" as ")
            .push(self.alias);

        if let Some(filter) = filter {
            writer.push(" where ");
            let mut next_param = 0usize;
            filter.push_ql(&mut writer, qualify, &mut next_param);
        }

        if let Some(sort) = sort {
            writer.push(" order by ");
            let mut first = true;
            for key in sort.keys() {
                if !first {
                    writer.push(", ");
                }
                first = false;
                writer.push(&qualify(&key.field));
                if key.ascending != reverse {
                    writer.push(" asc nulls last");
                } else {
                    writer.push(" desc nulls first");
                }
            }
        }

        Ok(writer.finish())
    }
}

impl Filter {
    /// Parameter names come from the leaf's pre-order position, so two leaves on the
    /// same field never share a name.
    fn push_ql(&self, writer: &mut QueryWriter, qualify: FieldQualifier<'_>, next: &mut usize) {
        match self {
            Filter::Equal { field, value } => {
                let name = param_name(next);
                writer.push("(").push(&qualify(field)).push(" = ");
                writer.push_bind(name, value.clone()).push(")");
            }
            Filter::Compare { field, op, value } => {
                let name = param_name(next);
                writer
                    .push("(")
                    .push(&qualify(field))
                    .push(" ")
                    .push(op.as_str())
                    .push(" ");
                writer.push_bind(name, value.clone()).push(")");
            }
            Filter::Interval { field, start, end } => {
                let name = param_name(next);
                writer.push("(").push(&qualify(field)).push(" between ");
                writer.push_bind(format!("{name}_start"), start.clone());
                writer.push(" and ");
                writer.push_bind(format!("{name}_end"), end.clone()).push(")");
            }
            Filter::IsNull { field } => {
                *next += 1;
                writer.push("(").push(&qualify(field)).push(" is null)");
            }
            // every operand renders its own parentheses
            Filter::Not(inner) => {
                writer.push("not ");
                inner.push_ql(writer, qualify, next);
            }
            Filter::And(children) => push_junction(writer, children, " and ", qualify, next),
            Filter::Or(children) => push_junction(writer, children, " or ", qualify, next),
        }
    }
}

fn param_name(next: &mut usize) -> String {
    let name = format!("p{next}");
    *next += 1;
    name
}

fn push_junction(
    writer: &mut QueryWriter,
    children: &[Filter],
    separator: &str,
    qualify: FieldQualifier<'_>,
    next: &mut usize,
) {
    writer.push("(");
    let mut iter = children.iter();
    if let Some(first) = iter.next() {
        first.push_ql(writer, qualify, next);
    }
    for child in iter {
        writer.push(separator);
        child.push_ql(writer, qualify, next);
    }
    writer.push(")");
}

/// What a query returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    Count,
    Identifier,
}

/// Structured form of a rendered query, for backends that evaluate rather than parse.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    pub projection: Projection,
    pub filter: Option<Filter>,
    pub sort: Option<SortSpec>,
    pub reverse: bool,
}

/// A rendered query plus paging, ready for a session to execute.
#[derive(Clone, Debug)]
pub struct Query {
    rendered: RenderedQuery,
    plan: QueryPlan,
    first_result: Option<u64>,
    max_results: Option<u64>,
}

impl Query {
    pub fn new(rendered: RenderedQuery, plan: QueryPlan) -> Self {
        Self {
            rendered,
            plan,
            first_result: None,
            max_results: None,
        }
    }

    pub fn first_result(mut self, first: u64) -> Self {
        self.first_result = Some(first);
        self
    }

    pub fn max_results(mut self, max: u64) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn rendered(&self) -> &RenderedQuery {
        &self.rendered
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn offset(&self) -> Option<u64> {
        self.first_result
    }

    pub fn limit(&self) -> Option<u64> {
        self.max_results
    }
}
