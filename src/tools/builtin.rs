//! 内置工具：当前时间、回显、算术表达式求值

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tools::{Tool, ToolError};

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        Some(_) => Err(ToolError::InvalidParam(format!("{} cannot be empty", key))),
        None => Err(ToolError::InvalidParam(format!("{} must be a string", key))),
    }
}

/// get_time：返回当前时间（RFC3339）
pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current time and date"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, _args: &Value) -> Result<String, ToolError> {
        Ok(format!("Current time: {}", chrono::Local::now().to_rfc3339()))
    }
}

/// echo：原样回显消息
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided message"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParam("message must be a string".to_string()))?;
        Ok(format!("Echo: {}", message))
    }
}

/// calculate：四则运算表达式求值（+ - * /、括号、一元负号）
pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate a simple mathematical expression (e.g., '2 + 3 * 4')"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "A mathematical expression to evaluate (e.g., '2 + 3 * 4')"
                }
            },
            "required": ["expression"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: &Value) -> Result<String, ToolError> {
        let expression = require_str(args, "expression")?;
        let value = eval_expression(expression)
            .map_err(|e| ToolError::InvalidParam(format!("failed to parse expression: {}", e)))?;
        Ok(format!("Result: {}", value))
    }
}

/// 递归下降求值：expr := term (('+'|'-') term)*，term := factor (('*'|'/') factor)*
fn eval_expression(input: &str) -> Result<f64, String> {
    let tokens: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected character '{}' at position {}", tokens[pos], pos));
    }
    Ok(value)
}

fn parse_expr(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_term(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        if op != '+' && op != '-' {
            break;
        }
        *pos += 1;
        let rhs = parse_term(tokens, pos)?;
        value = if op == '+' { value + rhs } else { value - rhs };
    }
    Ok(value)
}

fn parse_term(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_factor(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        if op != '*' && op != '/' {
            break;
        }
        *pos += 1;
        let rhs = parse_factor(tokens, pos)?;
        if op == '*' {
            value *= rhs;
        } else {
            if rhs == 0.0 {
                return Err("division by zero".to_string());
            }
            value /= rhs;
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    match tokens.get(*pos) {
        Some('-') => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some('(') => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            if tokens.get(*pos) != Some(&')') {
                return Err("missing closing parenthesis".to_string());
            }
            *pos += 1;
            Ok(value)
        }
        Some(c) if c.is_ascii_digit() || *c == '.' => {
            let start = *pos;
            while let Some(c) = tokens.get(*pos) {
                if c.is_ascii_digit() || *c == '.' {
                    *pos += 1;
                } else {
                    break;
                }
            }
            let s: String = tokens[start..*pos].iter().collect();
            s.parse::<f64>().map_err(|_| format!("invalid number: {}", s))
        }
        Some(c) => Err(format!("unexpected character '{}'", c)),
        None => Err("unexpected end of expression".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let tool = EchoTool;
        let out = tool
            .execute(CancellationToken::new(), &json!({"message": "X"}))
            .await
            .unwrap();
        assert_eq!(out, "Echo: X");
    }

    #[tokio::test]
    async fn test_echo_missing_param() {
        let tool = EchoTool;
        let err = tool
            .execute(CancellationToken::new(), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAM");
    }

    #[tokio::test]
    async fn test_get_time_not_empty() {
        let tool = GetTimeTool;
        let out = tool.execute(CancellationToken::new(), &json!({})).await.unwrap();
        assert!(out.starts_with("Current time: "));
    }

    #[test]
    fn test_eval_precedence() {
        assert_eq!(eval_expression("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval_expression("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval_expression("-3 + 5").unwrap(), 2.0);
        assert_eq!(eval_expression("10 / 4").unwrap(), 2.5);
        assert_eq!(eval_expression("2 * -(1 + 1)").unwrap(), -4.0);
    }

    #[test]
    fn test_eval_errors() {
        assert!(eval_expression("").is_err());
        assert!(eval_expression("2 +").is_err());
        assert!(eval_expression("(1 + 2").is_err());
        assert!(eval_expression("1 / 0").is_err());
        assert!(eval_expression("abc").is_err());
    }
}
